//! Typed errors for the sync and parse pipeline.
//!
//! Setup paths (config, db, migrations) use `anyhow`; everything the
//! orchestrator has to classify and react to is one of these enums.

use thiserror::Error;

/// Failure talking to the upstream source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Network failure, timeout, rate limit, 5xx or malformed response.
    /// Retried with backoff; exhaustion fails one entity.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Unreachable or unauthorized upstream. Aborts the whole session.
    #[error("upstream configuration error: {0}")]
    Configuration(String),

    #[error("not found upstream: {0}")]
    NotFound(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, UpstreamError::Configuration(_))
    }
}

/// Why a blob was rejected before extraction. Malformed blobs are an
/// expected input; every rejection carries a reason that is stored on the
/// elevation as its parse error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("blob is empty")]
    Empty,

    #[error("blob is not a database container: {0}")]
    NotContainer(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("missing required table '{0}'")]
    MissingTable(String),

    #[error("missing required column '{table}.{column}'")]
    MissingColumn { table: String, column: String },

    #[error("no primary data record in '{0}'")]
    NoPrimaryRecord(String),

    #[error("blob could not be materialized: {0}")]
    Unavailable(String),
}

/// Failure of the parse pipeline itself (as opposed to a rejected blob).
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("elevation not found in cache: {0}")]
    ElevationNotFound(String),

    /// The stored content hash moved between the idempotency read and the
    /// commit.
    #[error("content hash of elevation {elevation_id} changed during parse")]
    Consistency { elevation_id: String },

    #[error("cache store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Submission or execution failure reported by the job queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job queue is closed")]
    QueueClosed,

    #[error("job timed out after {0}s")]
    TimedOut(u64),

    #[error("job was dropped before completing")]
    Dropped,
}
