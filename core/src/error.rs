//! Closed error taxonomy for the gateway core.
//!
//! Library code returns `Result<T, GatewayError>`; only the daemon's `main`
//! collapses errors into an `anyhow::Error` at the process boundary. Variants
//! never carry question or response text — see the propagation policy this
//! mirrors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("queue full at depth {depth}, estimated wait {estimated_wait_secs}s")]
    QueueFull {
        depth: usize,
        estimated_wait_secs: u64,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("model artifact missing")]
    ModelMissing,

    #[error("model incompatible: {0}")]
    Incompatible(String),

    #[error("out of memory during decode")]
    OutOfMemory,

    #[error("context window overflow: prompt required {required} tokens, window is {window}")]
    ContextOverflow { required: u32, window: u32 },

    #[error("integrity check failed for {subject}, grade {grade}, version {version}")]
    IntegrityFailure {
        subject: String,
        grade: u8,
        version: String,
    },

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("degraded: {0}")]
    Degraded(String),

    #[error("not found")]
    NotFound,

    #[error("session expired")]
    Expired,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for GatewayError {
    fn from(e: r2d2::Error) -> Self {
        GatewayError::ResourceUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::ResourceUnavailable(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::Timeout(std::time::Duration::default())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
