use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::ProviderError;
use crate::storage::StorageError;
use crate::workflow::WorkflowStep;

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Unsupported document container: {0}")]
    UnsupportedFormat(String),

    #[error("Text extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Interpretation failed: {0}")]
    InterpretationFailed(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Cannot navigate from {from:?} to {to:?}")]
    InvalidTransition { from: WorkflowStep, to: WorkflowStep },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Stable error codes surfaced across the pipeline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnsupportedFormat,
    ExtractionFailed,
    InterpretationFailed,
    ProviderUnavailable,
    RateLimited,
    ValidationFailed,
    InvalidTransition,
    Cancelled,
    SessionNotFound,
    StorageFailed,
    ConfigInvalid,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorCode::ExtractionFailed => "EXTRACTION_FAILED",
            ErrorCode::InterpretationFailed => "INTERPRETATION_FAILED",
            ErrorCode::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::StorageFailed => "STORAGE_FAILED",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
        }
    }
}

/// Normalized `{ code, message }` form of every error that leaves the pipeline.
///
/// Messages are written for end users. Raw provider bodies are logged where the
/// error is produced and never copied in here, except rate-limit notices which
/// tell the user what to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct PipelineFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl PipelineFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, CANCELLED_MESSAGE)
    }
}

pub const CANCELLED_MESSAGE: &str = "Analysis was cancelled before it could finish";

impl FlowError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FlowError::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            FlowError::ExtractionFailed(_) => ErrorCode::ExtractionFailed,
            FlowError::InterpretationFailed(_) => ErrorCode::InterpretationFailed,
            FlowError::Validation(_) => ErrorCode::ValidationFailed,
            FlowError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            FlowError::Cancelled => ErrorCode::Cancelled,
            FlowError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            FlowError::Provider(e) if e.is_rate_limited() => ErrorCode::RateLimited,
            FlowError::Provider(ProviderError::Cancelled) => ErrorCode::Cancelled,
            FlowError::Provider(_) => ErrorCode::ProviderUnavailable,
            FlowError::Storage(_) => ErrorCode::StorageFailed,
            FlowError::Config(_) => ErrorCode::ConfigInvalid,
        }
    }

    /// Message safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            FlowError::UnsupportedFormat(kind) => format!(
                "This file type ({kind}) is not supported. Upload a photo (JPEG/PNG) or a PDF of the report."
            ),
            FlowError::ExtractionFailed(_) => {
                "We could not read the report. Please retake the photo in good light and try again."
                    .to_string()
            }
            FlowError::InterpretationFailed(_) => {
                "The clinical interpretation could not be generated. You can try again without re-uploading."
                    .to_string()
            }
            FlowError::Validation(reason) => reason.clone(),
            FlowError::InvalidTransition { from, to } => {
                format!("Cannot move from {from:?} to {to:?} yet")
            }
            FlowError::Cancelled => CANCELLED_MESSAGE.to_string(),
            FlowError::SessionNotFound(id) => format!("Session {id} was not found"),
            FlowError::Provider(e) => e.user_message(),
            FlowError::Storage(_) => "Saving progress failed. Your analysis continues.".to_string(),
            FlowError::Config(reason) => format!("Service misconfigured: {reason}"),
        }
    }
}

impl From<FlowError> for PipelineFailure {
    fn from(error: FlowError) -> Self {
        PipelineFailure::new(error.code(), error.user_message())
    }
}

impl From<&FlowError> for PipelineFailure {
    fn from(error: &FlowError) -> Self {
        PipelineFailure::new(error.code(), error.user_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_keeps_actionable_message() {
        let error = FlowError::Provider(ProviderError::Http {
            status: 429,
            body: "quota exceeded for key abc".to_string(),
        });
        let failure = PipelineFailure::from(error);
        assert_eq!(failure.code, ErrorCode::RateLimited);
        assert!(failure.message.contains("rate limit"));
    }

    #[test]
    fn provider_body_is_not_leaked() {
        let error = FlowError::Provider(ProviderError::Http {
            status: 500,
            body: "stacktrace: secret internals".to_string(),
        });
        let failure = PipelineFailure::from(error);
        assert_eq!(failure.code, ErrorCode::ProviderUnavailable);
        assert!(!failure.message.contains("secret"));
    }

    #[test]
    fn code_serializes_screaming_snake() {
        let failure = PipelineFailure::cancelled();
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["code"], "CANCELLED");
        assert_eq!(ErrorCode::Cancelled.as_str(), "CANCELLED");
    }
}
