//! Kernel error types.

use quire_crdt::DocError;
use quire_types::DocumentId;

/// Errors surfaced by the scheduler's public operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("document error: {0}")]
    Doc(#[from] DocError),

    #[error("document not open: {0}")]
    DocumentNotOpen(DocumentId),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// Failure reported by an external backend call.
///
/// Executors turn these into terminal item statuses; they never escape an
/// executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Backend could not be reached or died mid-call.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Backend accepted the call but failed to carry it out.
    #[error("backend failed: {0}")]
    Failed(String),

    /// Backend stopped because the call was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Backends built on `anyhow` can use `?` directly; the full context chain
/// becomes the failure message.
impl From<anyhow::Error> for BackendError {
    fn from(e: anyhow::Error) -> Self {
        BackendError::Failed(format!("{e:#}"))
    }
}
