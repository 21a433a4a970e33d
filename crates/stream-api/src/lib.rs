#![forbid(unsafe_code)]

pub mod app;
pub mod auth;
pub mod error;
pub mod ratelimit;
pub mod routes;
pub mod state;
pub mod validate;

pub use app::build_app;
pub use error::ApiError;
pub use state::{ApiConfig, AppState};
