//! Error types for the deep-research core.
//!
//! Uses `thiserror` with structured variants. Every variant carries a stable
//! `kind()` string surfaced in the client error envelope, and some carry a
//! remediation `hint()`.

use crate::types::TaskStatus;
use uuid::Uuid;

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, ResearchError>;

/// Top-level error type for the deep-research core library.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("research provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    #[error("research provider reported failure: {message}")]
    ProviderFailed { message: String },

    #[error("provider session expired: the remote service discarded this research session")]
    SessionExpired,

    #[error("no research task found with id {task_id}")]
    NotFound { task_id: Uuid },

    #[error("task {task_id} has no results yet (status: {status}, progress: {progress}%)")]
    NotCompleted {
        task_id: Uuid,
        status: TaskStatus,
        progress: u8,
    },

    #[error("task {task_id} is already {status} and cannot be cancelled")]
    AlreadyTerminal { task_id: Uuid, status: TaskStatus },

    #[error("too many background research tasks (max {max})")]
    CapacityExceeded { max: usize },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ResearchError {
    /// Stable error kind string for the client-facing envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ResearchError::InvalidInput { .. } => "invalid_input",
            ResearchError::ProviderUnavailable { .. } => "provider_unavailable",
            ResearchError::ProviderFailed { .. } => "provider_failed",
            ResearchError::SessionExpired => "session_expired",
            ResearchError::NotFound { .. } => "not_found",
            ResearchError::NotCompleted { .. } => "not_completed",
            ResearchError::AlreadyTerminal { .. } => "already_terminal",
            ResearchError::CapacityExceeded { .. } => "capacity_exceeded",
            ResearchError::Storage { .. } => "storage",
            ResearchError::Io { .. } => "io",
            ResearchError::Serialization(_) => "serialization",
        }
    }

    /// Optional remediation hint for the client.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ResearchError::ProviderUnavailable { .. } => {
                Some("check the API key environment variable and network connectivity")
            }
            ResearchError::NotCompleted { .. } => {
                Some("poll the status tool until the task completes")
            }
            ResearchError::CapacityExceeded { .. } => {
                Some("wait for a running task to finish, or cancel one, then retry")
            }
            ResearchError::Io { .. } => {
                Some("check permissions and free space, or choose another output_dir")
            }
            _ => None,
        }
    }
}
