use redis::Client;

/// Optional Redis client: `None` when REDIS_URL is unset or empty.
pub fn create_client(redis_url: Option<&str>) -> Result<Option<Client>, redis::RedisError> {
    match redis_url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => Client::open(url).map(Some),
        None => Ok(None),
    }
}
