//! Errors raised by built-in states.

use pipewright_engine::EngineError;
use thiserror::Error;

/// Errors that can occur inside a built-in state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Required property missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Process could not be spawned or awaited.
    #[error("Process error: {0}")]
    Process(String),

    /// Process outlived its deadline.
    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        StateError::Io(e.to_string())
    }
}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Configuration(msg) => EngineError::Validation(msg),
            other => EngineError::StateExecution(other.to_string()),
        }
    }
}
