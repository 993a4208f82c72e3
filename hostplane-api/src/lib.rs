// Library entry point for tests and external usage

pub mod api_docs;
pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod setup;

pub use app::AppState;
