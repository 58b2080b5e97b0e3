pub mod alias;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod rotation;
pub mod upstream;

pub use config::{ApiFormat, AuthMode, Config, ProviderConfig, Settings};
pub use engine::{Gateway, GatewayResponse};
pub use error::GatewayError;
