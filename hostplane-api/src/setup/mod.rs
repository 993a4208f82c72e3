// Setup and initialization modules
pub mod migrations;

pub use migrations::run_migrations;
