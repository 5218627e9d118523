pub mod config;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod schema;

pub mod postgres;

pub use config::ValidatedConfig;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
