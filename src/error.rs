use thiserror::Error;

use crate::gateway::{
    BufferError, ConfigError, PolicyError, PricingTableError, RedisStoreError,
};

/// Startup and wiring failures. Per-request failures are
/// [`crate::gateway::GatewayError`].
#[derive(Debug, Error)]
pub enum ApiRouterError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("redis error: {0}")]
    Redis(#[from] RedisStoreError),
    #[error("usage buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("routing policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("pricing table error: {0}")]
    Pricing(#[from] PricingTableError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ApiRouterError>;
