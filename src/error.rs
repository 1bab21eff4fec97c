// src/error.rs
use thiserror::Error;

/// Errors surfaced by the core to its callers. Background tasks never
/// propagate these out of a tick; they log and wait for the next interval.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    // Requested debit exceeds the computed spendable figure. The figure is
    // carried so the caller can report it as diagnostic context.
    #[error("insufficient funds (spendable {spendable})")]
    InsufficientFunds { spendable: f64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no default address for user")]
    NoDefaultAddress,

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    /// Duplicate-key violations on identifier/code claims are a distinct
    /// outcome, not a generic store failure.
    pub fn from_store_unique(e: rusqlite::Error, what: &str) -> Self {
        if is_unique_violation(&e) {
            CoreError::Conflict(what.to_string())
        } else {
            CoreError::Store(e)
        }
    }
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
