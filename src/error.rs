//! Error types for the underwriting orchestrator

use crate::models::Phase;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, UnderwritingError>;

#[derive(Error, Debug)]
pub enum UnderwritingError {

    // =============================
    // Orchestration Taxonomy
    // =============================

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Transient provider error ({provider}): {message}")]
    TransientProviderError { provider: String, message: String },

    #[error("Step '{step}' exhausted all providers after {attempts} attempt(s): {last_error}")]
    ExhaustedFallbackError {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Signal '{signal}' rejected for instance {instance_id} in phase {phase}")]
    InvalidSignalError {
        instance_id: Uuid,
        signal: String,
        phase: Phase,
    },

    #[error("Result for instance {instance_id} not ready (phase {phase})")]
    NotReadyError { instance_id: Uuid, phase: Phase },

    // =============================
    // Engine & Persistence Errors
    // =============================

    #[error("Instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("State conflict for instance {0}: record was modified concurrently")]
    StateConflict(Uuid),

    #[error("State persistence error: {0}")]
    StateError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl UnderwritingError {
    /// Shorthand for a provider failure that the step executor should retry.
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientProviderError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether the step executor may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            UnderwritingError::TransientProviderError { .. }
            | UnderwritingError::LlmError(_)
            | UnderwritingError::HttpError(_)
            | UnderwritingError::SerializationError(_)
            | UnderwritingError::IoError(_) => true,
            UnderwritingError::ValidationError(_)
            | UnderwritingError::ExhaustedFallbackError { .. }
            | UnderwritingError::InvalidSignalError { .. }
            | UnderwritingError::NotReadyError { .. }
            | UnderwritingError::InstanceNotFound(_)
            | UnderwritingError::InvalidTransition { .. }
            | UnderwritingError::StateConflict(_)
            | UnderwritingError::StateError(_)
            | UnderwritingError::DatabaseError(_)
            | UnderwritingError::ConfigError(_)
            | UnderwritingError::ExecutionError(_)
            | UnderwritingError::SqlError(_)
            | UnderwritingError::UuidError(_) => false,
        }
    }

    /// Store failures worth another write attempt. A version conflict is not one of them.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            UnderwritingError::DatabaseError(_) | UnderwritingError::SqlError(_)
        )
    }

    /// Stable machine-readable code, used by the HTTP adapter and failure records.
    pub fn code(&self) -> &'static str {
        match self {
            UnderwritingError::ValidationError(_) => "validation_error",
            UnderwritingError::TransientProviderError { .. } => "transient_provider_error",
            UnderwritingError::ExhaustedFallbackError { .. } => "exhausted_fallback_error",
            UnderwritingError::InvalidSignalError { .. } => "invalid_signal_error",
            UnderwritingError::NotReadyError { .. } => "not_ready",
            UnderwritingError::InstanceNotFound(_) => "instance_not_found",
            UnderwritingError::InvalidTransition { .. } => "invalid_transition",
            UnderwritingError::StateConflict(_) => "state_conflict",
            UnderwritingError::StateError(_)
            | UnderwritingError::DatabaseError(_)
            | UnderwritingError::SqlError(_) => "state_error",
            UnderwritingError::LlmError(_) => "llm_error",
            UnderwritingError::ConfigError(_) => "config_error",
            UnderwritingError::ExecutionError(_) => "execution_error",
            UnderwritingError::SerializationError(_) => "serialization_error",
            UnderwritingError::HttpError(_) => "http_error",
            UnderwritingError::UuidError(_) => "invalid_id",
            UnderwritingError::IoError(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(UnderwritingError::transient("cibil", "503").is_retryable());
        assert!(UnderwritingError::LlmError("empty".into()).is_retryable());
        assert!(!UnderwritingError::ValidationError("amount".into()).is_retryable());
        assert!(!UnderwritingError::ExhaustedFallbackError {
            step: "fetch_credit_report".into(),
            attempts: 13,
            last_error: "down".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_store_unavailable_classification() {
        assert!(UnderwritingError::DatabaseError("connection reset".into()).is_store_unavailable());
        assert!(!UnderwritingError::StateConflict(Uuid::nil()).is_store_unavailable());
        assert!(!UnderwritingError::transient("cibil", "503").is_store_unavailable());
    }

    #[test]
    fn test_signal_error_message_names_phase() {
        let err = UnderwritingError::InvalidSignalError {
            instance_id: Uuid::nil(),
            signal: "human_review".into(),
            phase: Phase::Completed,
        };
        assert!(err.to_string().contains("completed"));
        assert_eq!(err.code(), "invalid_signal_error");
    }
}
