pub mod database;
pub mod redis;

use std::net::SocketAddr;

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8003";

/// HOSTPLANE_API_ADDR, or the default listen address.
pub fn api_addr() -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("HOSTPLANE_API_ADDR").unwrap_or_else(|_| DEFAULT_API_ADDR.to_string());
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid HOSTPLANE_API_ADDR '{}': {}", raw, e))
}
