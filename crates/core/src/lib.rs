#![warn(clippy::unwrap_used)]

pub mod codec;
pub mod config;
pub mod error;
pub mod inference;
pub mod types;

pub use config::AppConfig;
pub use error::{BrokerError, BrokerResult};
