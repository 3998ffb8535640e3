//! Resource pool error types.

use thiserror::Error;

/// Errors returned by slot pool operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No free, unreserved slot remains. Retryable once a unit releases.
    #[error("no free slot for unit {0}")]
    ResourceExhausted(String),

    #[error("unknown slot: {0}")]
    UnknownSlot(u16),
}

pub type PoolResult<T> = Result<T, PoolError>;
