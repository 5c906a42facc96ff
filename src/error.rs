//! Error types for turnstile.
//!
//! A denied request is not an error: it is a normal [`RateLimitResult`] with
//! `allowed == false`. Errors here are either fatal (bad configuration) or
//! store failures that the shared limiter absorbs before they reach a caller.
//!
//! [`RateLimitResult`]: crate::ratelimit::RateLimitResult

use thiserror::Error;

/// Main error type for turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration file or environment could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter was constructed with invalid parameters
    #[error("Misconfigured limiter: {0}")]
    Misconfigured(String),

    /// Shared counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Gossip mesh errors
    #[error("Mesh error: {0}")]
    Mesh(#[from] crate::mesh::ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Errors raised by shared counter store adapters.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis command or connection failure
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store did not answer within the configured timeout
    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The store cannot serve requests right now
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
