//! DeskRelay server library
//!
//! Real-time relay between customer chat widgets and agent dashboards.

pub mod auth;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod routes;
pub mod state;
pub mod upstream;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::{AppState, StartupError};
