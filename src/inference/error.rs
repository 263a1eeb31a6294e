//! Session error taxonomy

use thiserror::Error;

use crate::inference::backend::BackendError;
use crate::inference::model::ModelError;

/// Errors reported by sessions, their controllers and the registry
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Prompt is too long ({tokens} tokens, max {max})")]
    PromptTooLong { tokens: usize, max: usize },

    #[error("Backend evaluation failed: {0}")]
    BackendEvalFailure(String),

    #[error("Failed to load model: {0}")]
    ModelLoadFailure(String),

    #[error("Session is already generating")]
    AlreadyBusy,

    #[error("Session is not generating")]
    NotBusy,

    #[error("No session for character slot {0}")]
    UnknownSlot(usize),

    #[error("Session worker unavailable: {0}")]
    WorkerUnavailable(String),
}

impl SessionError {
    /// Whether the error only concerns the command that triggered it
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::PromptTooLong { .. }
                | SessionError::AlreadyBusy
                | SessionError::NotBusy
                | SessionError::UnknownSlot(_)
        )
    }
}

impl From<BackendError> for SessionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Load(msg) => SessionError::ModelLoadFailure(msg),
            BackendError::Eval(msg) | BackendError::State(msg) => {
                SessionError::BackendEvalFailure(msg)
            }
        }
    }
}

impl From<ModelError> for SessionError {
    fn from(e: ModelError) -> Self {
        SessionError::ModelLoadFailure(e.to_string())
    }
}
