//! Error taxonomy for the fix pipeline.
//!
//! Invalid sensor samples never produce an error value; they are dropped in
//! `capture`. Everything else is surfaced to the caller.

use thiserror::Error;

use crate::queue::FixId;

/// Durable store failure. Returned from every mutating queue operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("fix store error: {0}")]
    Store(#[from] fjall::Error),

    #[error("fix record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("corrupt fix record {id}: {reason}")]
    Corrupt { id: FixId, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by a `RemoteEndpoint`. The batch is rejected as a whole.
#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server rejected batch ({status}): {reason}")]
    Rejected { status: u16, reason: String },
}

impl EndpointError {
    /// Whether retrying the identical batch is unlikely to ever succeed.
    ///
    /// Client errors are permanent except request timeout (408) and rate
    /// limiting (429). This only affects logging and statistics; the batch
    /// stays queued either way.
    pub fn is_permanent(&self) -> bool {
        match self {
            EndpointError::Rejected { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            EndpointError::Network(_) | EndpointError::Timeout => false,
        }
    }
}

/// Why a flush attempt delivered nothing.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("execution grant expired before the batch was acknowledged")]
    GrantExpired,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tracking session has been stopped")]
    Stopped,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;
