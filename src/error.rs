//! Error types for resource store operations.
//!
//! Covers the whole taxonomy surfaced by the data-access layer:
//! - path and body validation (fail fast, no table access)
//! - unique constraint violations (rejected writes, not retried)
//! - counter bootstrap signal (recovered internally by the allocator)
//! - transient backend failures (retryable by the caller with backoff)
//! - persistence failures after validation passed

use thiserror::Error;

/// Errors that can occur during resource store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Path is malformed (empty, relative, empty segment, too long).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Request body is not usable (not an object, malformed `unique` list).
    #[error("invalid body: {0}")]
    InvalidBody(String),

    /// Another resource in the collection already holds this unique value.
    #[error("unique constraint violation in {collection}: {field} = {value}")]
    UniqueConstraintViolation {
        collection: String,
        field: String,
        value: String,
    },

    /// Atomic increment addressed a counter item that does not exist yet.
    #[error("counter not initialized: {0}")]
    CounterUninitialized(String),

    /// Backend is unreachable or failed at the transport level.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Backend rejected the request due to rate limiting or lock contention.
    #[error("throttled: {0}")]
    Throttled(String),

    /// A write failed after validation passed.
    #[error("persist failed: {0}")]
    PersistFailed(String),

    /// Operation did not complete within the configured timeout.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Non-transient backend error (missing table, bad request).
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::StoreUnavailable(_)
                | StoreError::Throttled(_)
                | StoreError::DeadlineExceeded(_)
        )
    }

    /// HTTP status code an adapter should report for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::InvalidPath(_)
            | StoreError::InvalidBody(_)
            | StoreError::Serialization(_) => 400,
            StoreError::UniqueConstraintViolation { .. } => 409,
            StoreError::Throttled(_) => 429,
            StoreError::StoreUnavailable(_) => 503,
            StoreError::DeadlineExceeded(_) => 504,
            StoreError::CounterUninitialized(_)
            | StoreError::PersistFailed(_)
            | StoreError::Config(_)
            | StoreError::Backend(_) => 500,
        }
    }

    /// Wrap a failed write into `PersistFailed`, keeping violations intact.
    pub(crate) fn into_persist_failed(self) -> Self {
        match self {
            err @ (StoreError::UniqueConstraintViolation { .. } | StoreError::PersistFailed(_)) => {
                err
            }
            other => StoreError::PersistFailed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
                Some(code) if is_sqlite_contention(code) => StoreError::Throttled(err.to_string()),
                _ => StoreError::Backend(err.to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::StoreUnavailable(err.to_string()),
            sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
                StoreError::Serialization(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

fn is_sqlite_contention(code: &str) -> bool {
    code.parse::<i32>()
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}
