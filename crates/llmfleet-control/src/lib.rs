pub mod api;
pub mod config;
pub mod error;
pub mod state;

pub use api::router;
pub use state::{AppState, ServerInfo};
