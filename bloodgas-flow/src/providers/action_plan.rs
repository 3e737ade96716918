use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{HttpEndpoint, ProviderError, RetryPolicy, response, retry_with_backoff};
use crate::model::{DocumentKind, Issue};

/// Fields checked before the generic ones when reading a plan response.
const PLAN_FIELDS: [&str; 3] = ["planText", "plan_text", "plan"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlanRequest {
    pub issue_title: String,
    pub issue_description: String,
    pub clinical_question: String,
    pub document_kind: DocumentKind,
}

impl ActionPlanRequest {
    pub fn for_issue(issue: &Issue, kind: DocumentKind) -> Self {
        Self {
            issue_title: issue.title.clone(),
            issue_description: issue.description.clone(),
            clinical_question: issue.clinical_question.clone(),
            document_kind: kind,
        }
    }

    /// A single request covering the whole interpretation.
    pub fn comprehensive(interpretation_text: &str, kind: DocumentKind) -> Self {
        Self {
            issue_title: "Comprehensive management plan".to_string(),
            issue_description: interpretation_text.to_string(),
            clinical_question:
                "What is the complete management plan for the findings in this interpretation?"
                    .to_string(),
            document_kind: kind,
        }
    }
}

#[async_trait]
pub trait ActionPlanProvider: Send + Sync {
    async fn generate(
        &self,
        request: &ActionPlanRequest,
        correlation_id: &str,
        token: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

pub struct HttpActionPlanClient {
    endpoint: HttpEndpoint,
    retry: RetryPolicy,
}

impl HttpActionPlanClient {
    pub fn new(endpoint: HttpEndpoint, retry: RetryPolicy) -> Self {
        Self { endpoint, retry }
    }
}

#[async_trait]
impl ActionPlanProvider for HttpActionPlanClient {
    async fn generate(
        &self,
        request: &ActionPlanRequest,
        correlation_id: &str,
        token: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let body = serde_json::to_value(request)
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
        let payload = retry_with_backoff("action plan", &self.retry, token, || {
            self.endpoint.post_json(&body, Some(correlation_id), token)
        })
        .await?;
        Ok(response::extract_text(&payload, &PLAN_FIELDS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let issue = Issue {
            title: "Lactic acidosis".to_string(),
            description: "Lactate 6.1".to_string(),
            clinical_question: "Source of hypoperfusion?".to_string(),
        };
        let value =
            serde_json::to_value(ActionPlanRequest::for_issue(&issue, DocumentKind::Arterial))
                .unwrap();
        assert_eq!(
            value,
            json!({
                "issueTitle": "Lactic acidosis",
                "issueDescription": "Lactate 6.1",
                "clinicalQuestion": "Source of hypoperfusion?",
                "documentKind": "arterial",
            })
        );
    }

    #[test]
    fn plan_text_is_preferred() {
        let payload = json!({ "message": "ok", "planText": "1. Give fluids" });
        assert_eq!(response::extract_text(&payload, &PLAN_FIELDS), "1. Give fluids");
    }
}
