pub mod adapters;
pub mod api;
pub mod settings;
pub mod telemetry;

pub use api::{router, ApiError, AppState};
pub use settings::ServerConfig;
