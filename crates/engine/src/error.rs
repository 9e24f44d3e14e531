//! Error types for the Pipewright engine.
//!
//! Errors fall into a small taxonomy that callers match on:
//!
//! - evaluation errors from expressions (`Evaluation`)
//! - failures raised by a state's execute/resume contract (`StateExecution`)
//! - notification delivery problems (`Delivery`)
//! - optimistic-concurrency conflicts (`VersionConflict`, `Conflict`)
//!
//! Interrupts that do not apply to an instance are not errors; see
//! [`crate::engine::InterruptOutcome`].

use thiserror::Error;

use crate::instance::ExecutionStatus;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error (bad definition, bad arguments)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Expression could not be parsed or resolved
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// A state's execute or resume contract failed
    #[error("State execution error: {0}")]
    StateExecution(String),

    /// A notification could not be delivered or consumed
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// A single optimistic update lost the race
    #[error("Version conflict on {instance_id}: expected {expected}, found {found}")]
    VersionConflict {
        instance_id: String,
        expected: u64,
        found: u64,
    },

    /// Optimistic update retries exhausted
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Status change outside the lifecycle graph
    #[error("Invalid status transition for {instance_id}: {from} -> {to}")]
    InvalidTransition {
        instance_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// Secret or variable could not be resolved
    #[error("Secret resolution error: {0}")]
    SecretResolution(String),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parse error (YAML, JSON, etc.)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether retrying the same optimistic update may succeed.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, EngineError::VersionConflict { .. })
    }
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

impl From<minijinja::Error> for EngineError {
    fn from(err: minijinja::Error) -> Self {
        EngineError::Evaluation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = EngineError::NotFound("instance abc".to_string());
        assert_eq!(err.to_string(), "Resource not found: instance abc");
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = EngineError::InvalidTransition {
            instance_id: "i-1".to_string(),
            from: ExecutionStatus::Success,
            to: ExecutionStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for i-1: SUCCESS -> RUNNING"
        );
    }

    #[test]
    fn test_version_conflict_detection() {
        let err = EngineError::VersionConflict {
            instance_id: "i-1".to_string(),
            expected: 2,
            found: 3,
        };
        assert!(err.is_version_conflict());
        assert!(!EngineError::Conflict("x".to_string()).is_version_conflict());
    }

    #[test]
    fn test_yaml_error_maps_to_parse() {
        let err: EngineError = serde_yaml::from_str::<Vec<String>>("{ not: [valid")
            .unwrap_err()
            .into();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}
