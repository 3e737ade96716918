use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{HttpEndpoint, ProviderError, RetryPolicy, response, retry_with_backoff};
use crate::model::Document;

/// Text recovered by a vision model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisionText {
    pub text: String,
    pub confidence: f32,
}

/// A paid vision-capable model that re-reads a document the free pass rejected.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn extract(
        &self,
        document: &Document,
        token: &CancellationToken,
    ) -> Result<VisionText, ProviderError>;
}

/// Vision endpoint taking `{ fileName?, mimeType, documentKind, data }`.
pub struct HttpVisionClient {
    endpoint: HttpEndpoint,
    retry: RetryPolicy,
}

impl HttpVisionClient {
    pub fn new(endpoint: HttpEndpoint, retry: RetryPolicy) -> Self {
        Self { endpoint, retry }
    }
}

#[async_trait]
impl VisionProvider for HttpVisionClient {
    async fn extract(
        &self,
        document: &Document,
        token: &CancellationToken,
    ) -> Result<VisionText, ProviderError> {
        let mut body = json!({
            "mimeType": document.mime_type.as_deref().unwrap_or("application/octet-stream"),
            "documentKind": document.kind.as_str(),
            "data": STANDARD.encode(&document.bytes),
        });
        if let Some(name) = &document.file_name {
            body["fileName"] = json!(name);
        }

        info!(
            url = self.endpoint.url(),
            bytes = document.bytes.len(),
            "Requesting vision extraction"
        );
        let payload = retry_with_backoff("vision extraction", &self.retry, token, || {
            self.endpoint.post_json(&body, None, token)
        })
        .await?;

        let text = response::extract_text(&payload, &[]);
        let confidence =
            response::extract_confidence(&payload).unwrap_or_else(|| heuristic_confidence(&text));
        Ok(VisionText { text, confidence })
    }
}

/// Confidence estimate for model output that carries none.
///
/// Longer output scores higher, with small bonuses for headers, tables and
/// lists. Never above 0.95.
pub fn heuristic_confidence(text: &str) -> f32 {
    if text.trim().is_empty() {
        return 0.0;
    }

    let base: f32 = match text.len() {
        0..50 => 0.2,
        50..200 => 0.4,
        200..500 => 0.6,
        _ => 0.8,
    };

    let has_headers = text.lines().any(|l| l.starts_with('#'));
    let has_tables = text.lines().any(|l| l.matches('|').count() >= 2);
    let has_lists = text
        .lines()
        .any(|l| l.trim_start().starts_with("- ") || l.trim_start().starts_with("* "));

    let bonus = [(has_headers, 0.05), (has_tables, 0.05), (has_lists, 0.03)]
        .iter()
        .filter(|(present, _)| *present)
        .map(|(_, bonus)| bonus)
        .sum::<f32>();

    (base + bonus).min(0.95)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_scales_with_length() {
        assert_eq!(heuristic_confidence(""), 0.0);
        assert_eq!(heuristic_confidence("pH 7.40"), 0.2);
        assert_eq!(heuristic_confidence(&"a".repeat(120)), 0.4);
        assert_eq!(heuristic_confidence(&"a".repeat(600)), 0.8);
    }

    #[test]
    fn heuristic_rewards_structure_and_caps() {
        let table = format!("# Blood gas\n| pH | 7.40 |\n- pCO2 40\n{}", "x".repeat(600));
        let score = heuristic_confidence(&table);
        assert!(score > 0.9 && score <= 0.95, "{score}");
    }
}
