//! Storage error types.

use std::time::Duration;

use thiserror::Error;

/// Metrics storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database stayed unreachable for the whole connect window.
    #[error("database unreachable after {0:?}")]
    ConnectTimeout(Duration),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// A query did not finish within the configured bound.
    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),

    /// `save` or `get` was called before `initialize` or after `close`.
    #[error("{0} backend is not initialized")]
    NotInitialized(&'static str),

    /// Transport error talking to the metrics server.
    #[error("metrics server request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The metrics server answered with a non-success status.
    #[error("metrics server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// A writer panicked while holding the in-memory store.
    #[error("in-memory store lock poisoned")]
    Poisoned,

    /// The observation is malformed.
    #[error("invalid result: {0}")]
    Invalid(String),
}
