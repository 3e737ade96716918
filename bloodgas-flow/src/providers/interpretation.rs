use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{HttpEndpoint, ProviderError, RetryPolicy, response, retry_with_backoff};
use crate::issues::parse_issues;
use crate::model::{DocumentKind, InterpretationResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretationRequest {
    pub text: String,
    pub document_kind: DocumentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_context: Option<String>,
}

/// Clinical-reasoning endpoint returning free text, possibly with an embedded
/// fenced issue block.
#[async_trait]
pub trait InterpretationProvider: Send + Sync {
    async fn interpret(
        &self,
        request: &InterpretationRequest,
        token: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

pub struct HttpInterpreter {
    endpoint: HttpEndpoint,
    retry: RetryPolicy,
}

impl HttpInterpreter {
    pub fn new(endpoint: HttpEndpoint, retry: RetryPolicy) -> Self {
        Self { endpoint, retry }
    }
}

#[async_trait]
impl InterpretationProvider for HttpInterpreter {
    async fn interpret(
        &self,
        request: &InterpretationRequest,
        token: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let body = serde_json::to_value(request)
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
        let payload = retry_with_backoff("interpretation", &self.retry, token, || {
            self.endpoint.post_json(&body, None, token)
        })
        .await?;
        Ok(response::extract_text(&payload, &["interpretation"]))
    }
}

/// Runs one interpretation under a deadline and shapes the result.
pub struct InterpretationClient {
    provider: Arc<dyn InterpretationProvider>,
    timeout: Duration,
}

impl InterpretationClient {
    pub fn new(provider: Arc<dyn InterpretationProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Submit `text` and split the answer into prose and issues.
    ///
    /// The call is abandoned when `token` is cancelled or the timeout passes;
    /// in both cases the provider sees a cancelled child token.
    pub async fn interpret(
        &self,
        text: &str,
        kind: DocumentKind,
        case_context: Option<String>,
        token: &CancellationToken,
    ) -> Result<InterpretationResult, ProviderError> {
        let request = InterpretationRequest {
            text: text.to_string(),
            document_kind: kind,
            case_context: case_context.clone(),
        };
        let child = token.child_token();

        info!(
            kind = kind.as_str(),
            chars = text.len(),
            has_context = case_context.is_some(),
            "Requesting clinical interpretation"
        );
        let raw = match tokio::time::timeout(self.timeout, self.provider.interpret(&request, &child))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                child.cancel();
                warn!(timeout = ?self.timeout, "Interpretation timed out");
                return Err(ProviderError::Timeout(self.timeout));
            }
        };

        let parsed = parse_issues(&raw);
        info!(issues = parsed.count, "Interpretation received");
        Ok(InterpretationResult {
            interpretation_text: scrub_artifacts(&parsed.stripped_text),
            issues: parsed.issues,
            document_kind: kind,
            case_context,
        })
    }
}

static LOG_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*\[(?:TRACE|DEBUG|INFO|WARN|WARNING|ERROR)\][^\n]*(?:\n|$)").ok()
});

static METADATA_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:execution time|tokens used|model|request id|correlation id)[ \t]*:[^\n]*(?:\n|$)",
    )
    .ok()
});

static BLANK_RUN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n){3,}").ok());

/// Drop log and metadata lines a model sometimes echoes back.
pub fn scrub_artifacts(text: &str) -> String {
    let mut scrubbed = text.to_string();
    for (pattern, replacement) in [(&*LOG_LINE, ""), (&*METADATA_LINE, ""), (&*BLANK_RUN, "\n\n")] {
        if let Some(re) = pattern {
            scrubbed = re.replace_all(&scrubbed, replacement).into_owned();
        }
    }
    scrubbed.trim().to_string()
}
