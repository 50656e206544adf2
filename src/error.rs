//! Crate-wide error types
//!
//! Service-layer functions return `anyhow::Result` throughout, matching the
//! rest of the codebase's style of attaching context at each boundary with
//! `.context(...)`. `OrchestratorError` exists for the few places callers
//! need to match on a specific failure kind rather than just log and bubble
//! up a message: the job queue's transient-vs-permanent retry decision, and
//! dedupe-conflict detection on job submission.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflicting dedupe key: {0}")]
    Conflict(String),

    #[error("indexer error: {0}")]
    Indexer(String),

    #[error("download client error: {0}")]
    DownloadClient(String),

    #[error("rate limited by upstream: {upstream}")]
    RateLimited { upstream: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Outcome a job handler reports back to the queue runner.
///
/// The queue's retry policy (spec: exponential backoff up to `maxAttempts`
/// for transient failures, immediate terminal `Failed` for permanent ones)
/// keys off this distinction rather than pattern-matching error text.
#[derive(Debug)]
pub enum HandlerError {
    /// Timeouts, 5xx, 429, handler panics caught by the runner: worth
    /// retrying with backoff until `maxAttempts` is exhausted.
    Transient(anyhow::Error),
    /// 4xx (other than 429), schema violations, anything obviously
    /// doomed to fail again: fails the job immediately without consuming
    /// retry budget.
    Permanent(anyhow::Error),
}

impl HandlerError {
    pub fn message(&self) -> String {
        match self {
            HandlerError::Transient(e) => e.to_string(),
            HandlerError::Permanent(e) => e.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for HandlerError {}

pub type HandlerResult = Result<serde_json::Value, HandlerError>;
