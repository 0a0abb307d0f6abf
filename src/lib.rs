pub mod backends;
pub mod config;
pub mod control;
pub mod handlers;
pub mod manager;
pub mod middleware;
pub mod protocol;
pub mod routes;
pub mod session;
pub mod state;

#[cfg(test)]
mod test_support;

// Re-export commonly used items for convenience
pub use backends::{Registries, global_registries};
pub use config::ServerConfig;
pub use manager::ModelManager;
pub use routes::create_app;
pub use state::AppState;
