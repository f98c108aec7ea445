//! Error types for Tabage

use crate::protocol::LifecycleState;
use crate::types::ResourceRef;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("stale reference: {0}")]
    StaleReference(ResourceRef),

    #[error("host operation failed: {operation} - {message}")]
    HostOperationFailed { operation: String, message: String },

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("engine not ready: {0}")]
    NotReady(LifecycleState),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn host_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HostOperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid(message.into())
    }

    /// Absent resource/container/entry. Callers recover from this locally.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
