//! Clients for the paid capability endpoints: vision OCR, clinical
//! interpretation and action plans.
//!
//! Every provider sits behind a trait so the pipeline can be driven by plain
//! HTTP endpoints, by OpenRouter, or by in-process doubles in tests. Response
//! shape guessing lives in [`response`] and nowhere else.

pub mod action_plan;
pub mod http;
pub mod interpretation;
pub mod openrouter;
pub mod response;
pub mod retry;
pub mod vision;

pub use action_plan::{ActionPlanProvider, ActionPlanRequest, HttpActionPlanClient};
pub use http::HttpEndpoint;
pub use interpretation::{
    HttpInterpreter, InterpretationClient, InterpretationProvider, InterpretationRequest,
};
pub use openrouter::OpenRouterVision;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use vision::{HttpVisionClient, VisionProvider, VisionText};

#[cfg(feature = "rig")]
pub use openrouter::{AgentSettings, RigActionPlanner, RigInterpreter};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// 429, 503 and connection-level failures are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => matches!(status, 429 | 503),
            ProviderError::Network(_) => true,
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::Http { status: 429, .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ProviderError::Http { status: 429, .. } => {
                "The AI service rate limit or quota was reached. Please wait a minute and try again."
                    .to_string()
            }
            ProviderError::Http { status: 503, .. } | ProviderError::Network(_) => {
                "The AI service is temporarily unavailable. Please try again shortly.".to_string()
            }
            ProviderError::Http { status, .. } if (400..500).contains(status) => {
                "The AI service rejected the request.".to_string()
            }
            ProviderError::Http { .. } | ProviderError::InvalidResponse(_) => {
                "The AI service returned an unexpected error.".to_string()
            }
            ProviderError::Timeout(_) => "The AI service took too long to respond.".to_string(),
            ProviderError::Cancelled => "The request was cancelled.".to_string(),
            ProviderError::InvalidRequest(reason) => reason.clone(),
            ProviderError::NotConfigured(what) => format!("{what} is not configured."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let http = |status| ProviderError::Http {
            status,
            body: String::new(),
        };
        assert!(http(429).is_transient());
        assert!(http(503).is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(!http(400).is_transient());
        assert!(!http(422).is_transient());
        assert!(!http(500).is_transient());
        assert!(!ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ProviderError::Cancelled.is_transient());
    }
}
