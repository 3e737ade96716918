use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ProviderError;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Longest provider error body kept for logs and error values.
const MAX_ERROR_BODY: usize = 2_000;

/// A JSON-over-HTTP capability endpoint.
#[derive(Clone)]
pub struct HttpEndpoint {
    client: Client,
    url: String,
    timeout: Duration,
    bearer_token: Option<String>,
}

impl HttpEndpoint {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            timeout,
            bearer_token: None,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST `body` and return the decoded response.
    ///
    /// Bodies that are not JSON come back as `Value::String`. Non-2xx statuses
    /// become [`ProviderError::Http`] so callers can classify them for retry.
    pub async fn post_json(
        &self,
        body: &Value,
        correlation_id: Option<&str>,
        token: &CancellationToken,
    ) -> Result<Value, ProviderError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(id) = correlation_id {
            request = request.header(CORRELATION_HEADER, id);
        }
        if let Some(bearer) = &self.bearer_token {
            request = request.header("Authorization", format!("Bearer {}", bearer));
        }

        let send = async {
            let response = request.send().await.map_err(|e| self.map_reqwest(e))?;
            let status = response.status();
            let text = response.text().await.map_err(|e| self.map_reqwest(e))?;

            if !status.is_success() {
                let body = truncate(&text, MAX_ERROR_BODY);
                warn!(
                    url = %self.url,
                    status = status.as_u16(),
                    correlation_id = correlation_id.unwrap_or("-"),
                    "Provider returned an error: {}",
                    body
                );
                return Err(ProviderError::Http {
                    status: status.as_u16(),
                    body,
                });
            }

            debug!(url = %self.url, bytes = text.len(), "Provider responded");
            Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ProviderError::Cancelled),
            result = send => result,
        }
    }

    fn map_reqwest(&self, error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else if error.is_decode() {
            ProviderError::InvalidResponse(error.to_string())
        } else {
            ProviderError::Network(error.to_string())
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
