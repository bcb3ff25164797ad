//! Error types for the sync orchestration core.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure returned by a caller-supplied sync operation.
///
/// The underlying `anyhow::Error` is kept behind an `Arc` so that every caller
/// coalesced onto the same queue entry observes the same failure.
#[derive(Clone)]
pub struct OperationFailure(Arc<anyhow::Error>);

impl OperationFailure {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// The error exactly as the operation returned it.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Downcast to the concrete error type the operation produced.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Debug for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for OperationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for OperationFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}

/// Errors surfaced by the queue, executor, diagnostics and orchestrator.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Sync operation '{label}' failed: {source}")]
    Operation {
        label: String,
        source: OperationFailure,
    },

    #[error("Sync operation '{label}' panicked: {message}")]
    OperationPanicked { label: String, message: String },

    #[error("Timed out after {timeout_ms}ms waiting on sync operation '{label}'")]
    LockTimeout { label: String, timeout_ms: u64 },

    #[error("Sync lock was force-released while '{label}' was waiting")]
    LockForceReleased { label: String },

    #[error("Queued sync operation '{operation_type}' was cancelled")]
    Cancelled { operation_type: String },

    #[error("Sync validation failed: {0}")]
    Validation(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// The caller's own operation error, if this is one.
    pub fn operation_error(&self) -> Option<&anyhow::Error> {
        match self {
            SyncError::Operation { source, .. } => Some(source.inner()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::LockTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled { .. })
    }

    pub(crate) fn operation(label: &str, error: anyhow::Error) -> Self {
        SyncError::Operation {
            label: label.to_string(),
            source: OperationFailure::new(error),
        }
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}
