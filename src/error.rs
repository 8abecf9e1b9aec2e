use std::time::Duration;

use crate::llm::LlmError;

/// Result type for stage internals
pub type Result<T> = std::result::Result<T, StageError>;

/// Everything that can end a stage early.
///
/// `Cancelled` is never shown to the user; every other variant becomes a
/// single human-readable failure message at the stage boundary.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transcoder failed: {0}")]
    Transcoder(String),

    #[error("transcoder timed out after {:.1}s", .0.as_secs_f64())]
    TranscoderTimeout(Duration),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("no speech detected")]
    NoSpeech,

    #[error("transcription timed out after {:.1}s", .0.as_secs_f64())]
    TranscriptionTimeout(Duration),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("{stage} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        stage: &'static str,
        attempts: u32,
        last: Box<StageError>,
    },

    #[error("LLM service unreachable: {0}")]
    Connectivity(String),

    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("LLM returned no rewritten text")]
    EmptyRewrite,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected error: {0}")]
    Internal(String),
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }

    /// Input validation failures are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StageError::Cancelled | StageError::InvalidInput(_))
    }
}

impl From<tokio::task::JoinError> for StageError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            StageError::Internal("background task panicked".to_string())
        } else {
            StageError::Internal(format!("background task aborted: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!StageError::Cancelled.is_retryable());
        assert!(!StageError::InvalidInput("missing".into()).is_retryable());
        assert!(StageError::NoSpeech.is_retryable());
        assert!(StageError::TranscriptionTimeout(Duration::from_secs(600)).is_retryable());
    }

    #[test]
    fn test_exhausted_message_keeps_last_error() {
        let err = StageError::RetriesExhausted {
            stage: "transcription",
            attempts: 3,
            last: Box::new(StageError::NoSpeech),
        };
        assert_eq!(
            err.to_string(),
            "transcription failed after 3 attempts: no speech detected"
        );
    }
}
