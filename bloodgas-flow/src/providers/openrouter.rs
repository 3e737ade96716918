//! OpenRouter-backed providers.
//!
//! Vision goes through the raw chat-completions endpoint because it needs
//! multi-part image content. Text-only capabilities use `rig` agents when the
//! `rig` feature is enabled.

use anyhow::anyhow;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageFormat};
use pdf2image::{PDF, Pages};
use serde_json::{Value, json};
use std::io::Cursor;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::vision::heuristic_confidence;
use super::{HttpEndpoint, ProviderError, RetryPolicy, VisionProvider, VisionText, retry_with_backoff};
use crate::extraction::{ContainerFormat, detect_container};
use crate::model::Document;

pub const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_VISION_MODEL: &str = "openai/gpt-4.1-mini";
pub const DEFAULT_TEXT_MODEL: &str = "openai/gpt-4o-mini";

const VISION_MAX_TOKENS: u32 = 4000;

fn api_key_from_env() -> Result<String, ProviderError> {
    std::env::var("OPENROUTER_API_KEY")
        .map_err(|_| ProviderError::NotConfigured("OPENROUTER_API_KEY".to_string()))
}

pub struct OpenRouterVision {
    endpoint: HttpEndpoint,
    model: String,
    retry: RetryPolicy,
}

impl OpenRouterVision {
    pub fn new(api_key: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            endpoint: HttpEndpoint::new(OPENROUTER_CHAT_URL, timeout).with_bearer_token(api_key),
            model: DEFAULT_VISION_MODEL.to_string(),
            retry,
        }
    }

    pub fn from_env(timeout: Duration, retry: RetryPolicy) -> Result<Self, ProviderError> {
        Ok(Self::new(api_key_from_env()?, timeout, retry))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: HttpEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    async fn image_parts(&self, document: &Document) -> Result<Vec<Value>, ProviderError> {
        let format = detect_container(document)
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
        let data_uris = match format {
            ContainerFormat::Image => {
                let mime = image::guess_format(&document.bytes)
                    .map(|f| f.to_mime_type().to_string())
                    .ok()
                    .or_else(|| document.mime_type.clone())
                    .unwrap_or_else(|| "image/png".to_string());
                vec![format!("data:{};base64,{}", mime, STANDARD.encode(&document.bytes))]
            }
            ContainerFormat::Pdf => render_pdf_pages(document.bytes.clone())
                .await?
                .iter()
                .map(|page| image_to_base64(page).map(|b64| format!("data:image/png;base64,{b64}")))
                .collect::<anyhow::Result<Vec<_>>>()
                .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?,
        };

        Ok(data_uris
            .into_iter()
            .map(|url| json!({ "type": "image_url", "image_url": { "url": url } }))
            .collect())
    }
}

#[async_trait]
impl VisionProvider for OpenRouterVision {
    async fn extract(
        &self,
        document: &Document,
        token: &CancellationToken,
    ) -> Result<VisionText, ProviderError> {
        let mut content = vec![json!({
            "type": "text",
            "text": vision_prompt(document),
        })];
        content.extend(self.image_parts(document).await?);
        info!(
            model = %self.model,
            parts = content.len(),
            "Sending document to OpenRouter vision model"
        );

        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": VISION_MAX_TOKENS,
        });
        let response = retry_with_backoff("openrouter vision", &self.retry, token, || {
            self.endpoint.post_json(&payload, None, token)
        })
        .await?;

        let text = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing choices[0].message.content".to_string())
            })?
            .trim()
            .to_string();
        Ok(VisionText {
            confidence: heuristic_confidence(&text),
            text,
        })
    }
}

fn vision_prompt(document: &Document) -> String {
    format!(
        "Transcribe every value printed on this {} report. Keep one parameter per line with its \
         value and unit (for example `pH 7.35`, `pCO2 45 mmHg`). Include the analyser name, \
         sample time and reference ranges when present. Output only the transcription.",
        document.kind.label()
    )
}

/// Rasterise every page on a blocking thread.
async fn render_pdf_pages(bytes: Vec<u8>) -> Result<Vec<DynamicImage>, ProviderError> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<DynamicImage>> {
        let path = std::env::temp_dir()
            .join(format!("bloodgas-{}.pdf", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        std::fs::write(&path, &bytes)?;
        let rendered = PDF::from_file(&path)
            .map_err(|e| anyhow!("Failed to load PDF: {}", e))
            .and_then(|pdf| {
                pdf.render(Pages::All, None)
                    .map_err(|e| anyhow!("Failed to render PDF pages: {}", e))
            });
        let _ = std::fs::remove_file(&path);
        let pages = rendered?;
        info!("Rendered {} pages from PDF", pages.len());
        Ok(pages)
    })
    .await
    .map_err(|e| ProviderError::InvalidRequest(format!("PDF render task failed: {e}")))?
    .map_err(|e| ProviderError::InvalidRequest(e.to_string()))
}

fn image_to_base64(image: &DynamicImage) -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| anyhow!("Failed to encode image: {}", e))?;
    Ok(STANDARD.encode(&buffer))
}

#[cfg(feature = "rig")]
mod agents {
    use async_trait::async_trait;
    use rig::{
        agent::Agent,
        client::CompletionClient,
        completion::{CompletionError, Prompt, PromptError},
        providers::openrouter,
    };
    use serde_json::Value;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tracing::debug;

    use super::{DEFAULT_TEXT_MODEL, api_key_from_env};
    use crate::providers::{
        ActionPlanProvider, ActionPlanRequest, InterpretationProvider, InterpretationRequest,
        ProviderError, RetryPolicy, retry_with_backoff,
    };

    const INTERPRETATION_PREAMBLE: &str = "You are a critical care physician interpreting blood gas reports. \
        Give a structured interpretation: acid-base status, primary disorder, compensation, \
        oxygenation, electrolytes and lactate when present, and the likely clinical picture. \
        After the interpretation, list the distinct clinical problems as a fenced JSON block:\n\
        ```json\n[{\"title\": \"...\", \"description\": \"...\", \"clinicalQuestion\": \"...\"}]\n```\n\
        Output an empty array when there is nothing to act on.";

    const ACTION_PLAN_PREAMBLE: &str = "You are a critical care physician. Write a concise, \
        prioritised action plan for the clinical problem you are given: immediate actions, \
        investigations, treatment and monitoring. Use numbered steps.";

    /// Where an agent sends its completions and how long a call may take.
    #[derive(Debug, Clone)]
    pub struct AgentSettings {
        pub api_key: String,
        pub base_url: Option<String>,
        pub model: String,
        pub timeout: Duration,
    }

    impl AgentSettings {
        pub fn from_env(model: Option<&str>, timeout: Duration) -> Result<Self, ProviderError> {
            Ok(Self {
                api_key: api_key_from_env()?,
                base_url: None,
                model: model.unwrap_or(DEFAULT_TEXT_MODEL).to_string(),
                timeout,
            })
        }

        pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
            self.base_url = Some(base_url.into());
            self
        }
    }

    fn build_agent(
        preamble: &str,
        settings: &AgentSettings,
    ) -> Result<Agent<openrouter::CompletionModel>, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;
        let mut builder = openrouter::Client::builder(&settings.api_key).custom_client(http_client);
        if let Some(base_url) = &settings.base_url {
            builder = builder.base_url(base_url);
        }
        let client = builder
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("OpenRouter client: {e}")))?;
        Ok(client.agent(&settings.model).preamble(preamble).build())
    }

    async fn prompt_agent(
        agent: &Agent<openrouter::CompletionModel>,
        prompt: &str,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let prompt = prompt.to_string();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ProviderError::Cancelled),
            result = async { agent.prompt(&prompt).await } => {
                result.map_err(|e| classify_prompt_error(e, timeout))
            }
        }
    }

    /// Map a rig failure onto the provider taxonomy so only 429, 503 and
    /// connection failures are retried.
    pub(super) fn classify_prompt_error(error: PromptError, timeout: Duration) -> ProviderError {
        let completion = match error {
            PromptError::CompletionError(completion) => completion,
            other => return ProviderError::InvalidResponse(other.to_string()),
        };
        match completion {
            CompletionError::HttpError(e) if e.is_timeout() => ProviderError::Timeout(timeout),
            CompletionError::HttpError(e) => match e.status() {
                Some(status) => ProviderError::Http {
                    status: status.as_u16(),
                    body: e.to_string(),
                },
                None if e.is_decode() => ProviderError::InvalidResponse(e.to_string()),
                None => ProviderError::Network(e.to_string()),
            },
            CompletionError::ProviderError(body) | CompletionError::ResponseError(body) => {
                match status_in_body(&body) {
                    Some(status) => ProviderError::Http { status, body },
                    None => ProviderError::InvalidResponse(body),
                }
            }
            CompletionError::JsonError(e) => ProviderError::InvalidResponse(e.to_string()),
            CompletionError::UrlError(e) => ProviderError::InvalidRequest(e.to_string()),
            CompletionError::RequestError(e) => ProviderError::InvalidRequest(e.to_string()),
        }
    }

    /// OpenRouter error bodies carry the status as `error.code`.
    fn status_in_body(body: &str) -> Option<u16> {
        let value: Value = serde_json::from_str(body).ok()?;
        [&value["error"]["code"], &value["code"], &value["status"]]
            .into_iter()
            .find_map(|code| {
                code.as_u64()
                    .or_else(|| code.as_str().and_then(|s| s.parse().ok()))
            })
            .and_then(|code| u16::try_from(code).ok())
            .filter(|code| (100..600).contains(code))
    }

    /// Clinical interpretation through an OpenRouter model.
    pub struct RigInterpreter {
        agent: Agent<openrouter::CompletionModel>,
        timeout: Duration,
        retry: RetryPolicy,
    }

    impl RigInterpreter {
        pub fn new(settings: &AgentSettings, retry: RetryPolicy) -> Result<Self, ProviderError> {
            Ok(Self {
                agent: build_agent(INTERPRETATION_PREAMBLE, settings)?,
                timeout: settings.timeout,
                retry,
            })
        }

        pub fn from_env(
            model: Option<&str>,
            timeout: Duration,
            retry: RetryPolicy,
        ) -> Result<Self, ProviderError> {
            Self::new(&AgentSettings::from_env(model, timeout)?, retry)
        }
    }

    #[async_trait]
    impl InterpretationProvider for RigInterpreter {
        async fn interpret(
            &self,
            request: &InterpretationRequest,
            token: &CancellationToken,
        ) -> Result<String, ProviderError> {
            let mut prompt = format!(
                "Report type: {}\n\nExtracted report text:\n{}\n",
                request.document_kind.label(),
                request.text
            );
            if let Some(context) = &request.case_context {
                prompt.push_str(&format!("\nClinical context from the treating team:\n{context}\n"));
            }
            debug!(chars = prompt.len(), "Prompting interpretation agent");
            retry_with_backoff("rig interpretation", &self.retry, token, || {
                prompt_agent(&self.agent, &prompt, self.timeout, token)
            })
            .await
        }
    }

    /// Action plans through an OpenRouter model.
    pub struct RigActionPlanner {
        agent: Agent<openrouter::CompletionModel>,
        timeout: Duration,
        retry: RetryPolicy,
    }

    impl RigActionPlanner {
        pub fn new(settings: &AgentSettings, retry: RetryPolicy) -> Result<Self, ProviderError> {
            Ok(Self {
                agent: build_agent(ACTION_PLAN_PREAMBLE, settings)?,
                timeout: settings.timeout,
                retry,
            })
        }

        pub fn from_env(
            model: Option<&str>,
            timeout: Duration,
            retry: RetryPolicy,
        ) -> Result<Self, ProviderError> {
            Self::new(&AgentSettings::from_env(model, timeout)?, retry)
        }
    }

    #[async_trait]
    impl ActionPlanProvider for RigActionPlanner {
        async fn generate(
            &self,
            request: &ActionPlanRequest,
            correlation_id: &str,
            token: &CancellationToken,
        ) -> Result<String, ProviderError> {
            let prompt = format!(
                "Report type: {}\nProblem: {}\nDetails: {}\nClinical question: {}",
                request.document_kind.label(),
                request.issue_title,
                request.issue_description,
                request.clinical_question
            );
            debug!(correlation_id, "Prompting action plan agent");
            retry_with_backoff("rig action plan", &self.retry, token, || {
                prompt_agent(&self.agent, &prompt, self.timeout, token)
            })
            .await
        }
    }

}

#[cfg(feature = "rig")]
pub use agents::{AgentSettings, RigActionPlanner, RigInterpreter};
