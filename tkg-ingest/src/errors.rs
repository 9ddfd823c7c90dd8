//! Error types for tkg-ingest.

use uuid::Uuid;

use crate::model::statement::StatementStatus;

/// Alias for Results returning [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Top-level error type for tkg-ingest.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Embedder error: {message}")]
    Embedder { message: String, transient: bool },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Cluster {0} is being processed by another task")]
    Contention(Uuid),

    #[error("Statement {id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: StatementStatus,
        to: StatementStatus,
    },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl PipelineError {
    /// Permanent storage failure.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// Storage failure worth retrying (connection drop, lock timeout, ...).
    pub fn storage_transient(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: true,
        }
    }

    /// Permanent embedder failure.
    pub fn embedder(message: impl Into<String>) -> Self {
        Self::Embedder {
            message: message.into(),
            transient: false,
        }
    }

    /// Embedder failure worth retrying.
    pub fn embedder_transient(message: impl Into<String>) -> Self {
        Self::Embedder {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether the failure may succeed on a later attempt.
    ///
    /// Transient failures are retried with backoff and then requeued; everything
    /// else is either routed to review or reported as a per-item failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage { transient, .. } | Self::Embedder { transient, .. } => *transient,
            Self::Llm(e) => e.is_transient(),
            Self::Timeout(_) | Self::Contention(_) | Self::Queue(_) => true,
            _ => false,
        }
    }

    /// Whether the failure means the item itself is bad and needs a human.
    pub fn needs_review(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::InvalidTransition { .. } | Self::Serialization(_)
        ) || matches!(self, Self::Llm(LlmError::Refusal))
    }
}

/// LLM-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Rate limited")]
    RateLimit,

    #[error("Model refused to respond")]
    Refusal,

    #[error("Empty response from LLM")]
    EmptyResponse,

    #[error("Authentication failed")]
    Authentication,

    #[error("API error: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimit | Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        assert!(PipelineError::Llm(LlmError::RateLimit).is_transient());
        assert!(PipelineError::Llm(LlmError::Api {
            status: 503,
            message: "overloaded".into()
        })
        .is_transient());
        assert!(!PipelineError::Llm(LlmError::Api {
            status: 400,
            message: "bad request".into()
        })
        .is_transient());
        assert!(!PipelineError::Llm(LlmError::Authentication).is_transient());
    }

    #[test]
    fn timeouts_and_contention_are_transient() {
        assert!(PipelineError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(PipelineError::Contention(Uuid::nil()).is_transient());
    }

    #[test]
    fn storage_transience_follows_constructor() {
        assert!(PipelineError::storage_transient("conn reset").is_transient());
        assert!(!PipelineError::storage("constraint").is_transient());
    }

    #[test]
    fn validation_failures_go_to_review() {
        let err = PipelineError::Validation("bad date".into());
        assert!(err.needs_review());
        assert!(!err.is_transient());

        let err = PipelineError::InvalidTransition {
            id: Uuid::nil(),
            from: StatementStatus::Inactive,
            to: StatementStatus::Active,
        };
        assert!(err.needs_review());
    }

    #[test]
    fn display_includes_context() {
        let err = PipelineError::Llm(LlmError::Api {
            status: 500,
            message: "boom".into(),
        });
        assert_eq!(err.to_string(), "LLM error: API error: HTTP 500: boom");
    }
}
