// Application state and HTTP layers
pub mod state;

pub use state::AppState;

use tower_http::cors::{Any, CorsLayer};

/// CORS for the dashboard, which is served from another origin.
pub fn create_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
