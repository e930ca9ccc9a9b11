use holofs_store::StorageError;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Duplicate enqueue for {artifact_id}: entry {existing} already waiting at priority {priority}")]
    DuplicateEnqueue {
        artifact_id: String,
        existing: Uuid,
        priority: i32,
    },

    #[error("Queue entry not found: {0}")]
    EntryNotFound(Uuid),

    #[error("Queue entry not claimed: {0}")]
    EntryNotClaimed(Uuid),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Transform failed in stage {stage}: {message}")]
    TransformError { stage: String, message: String },

    #[error("Elicitation timed out in stage {stage} after {timeout_ms}ms")]
    ElicitationTimeout { stage: String, timeout_ms: u64 },

    #[error("Session {0} cancelled")]
    Cancelled(Uuid),

    #[error("Artifact {artifact_id} is held by session {owner}")]
    ArtifactBusy { artifact_id: String, owner: Uuid },

    #[error("No handler registered for stage {0}")]
    NoHandler(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn transform(stage: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::TransformError {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Retry classification
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::TransformError { .. }
            | OrchestratorError::ElicitationTimeout { .. }
            | OrchestratorError::ArtifactBusy { .. } => ErrorCategory::Transient,

            OrchestratorError::Storage(e) => match e.kind {
                holofs_store::ErrorKind::IO | holofs_store::ErrorKind::SourceUnavailable => {
                    ErrorCategory::Infrastructure
                }
                _ => ErrorCategory::Permanent,
            },
            OrchestratorError::Io(_) => ErrorCategory::Infrastructure,

            OrchestratorError::Config(_)
            | OrchestratorError::DuplicateEnqueue { .. }
            | OrchestratorError::EntryNotFound(_)
            | OrchestratorError::EntryNotClaimed(_)
            | OrchestratorError::SessionNotFound(_)
            | OrchestratorError::InvalidStateTransition { .. }
            | OrchestratorError::MalformedInput(_)
            | OrchestratorError::Cancelled(_)
            | OrchestratorError::NoHandler(_)
            | OrchestratorError::Serialization(_)
            | OrchestratorError::Bincode(_)
            | OrchestratorError::Parse(_) => ErrorCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry through the queue (transform failure, busy artifact)
    Transient,
    /// Permanent error - don't retry (malformed input, caller error)
    Permanent,
    /// Infrastructure error - alert ops (store I/O, unreachable source)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(OrchestratorError::transform("summary", "boom").is_transient());
        assert!(OrchestratorError::ElicitationTimeout {
            stage: "formatting".to_string(),
            timeout_ms: 10
        }
        .is_transient());
        assert_eq!(
            OrchestratorError::MalformedInput("empty".to_string()).category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            OrchestratorError::from(StorageError::not_found("/a")).category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            OrchestratorError::from(StorageError::source_unavailable("disk", "gone")).category(),
            ErrorCategory::Infrastructure
        );
    }

    #[test]
    fn test_duplicate_enqueue_message() {
        let err = OrchestratorError::DuplicateEnqueue {
            artifact_id: "/a".to_string(),
            existing: Uuid::nil(),
            priority: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("/a"));
        assert!(msg.contains("priority 5"));
    }
}
