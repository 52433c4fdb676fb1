pub mod api;
pub mod broadcast;
pub mod config;
pub mod detector;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod source;
pub mod state;
pub mod store;
pub mod text;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use state::ServiceState;
