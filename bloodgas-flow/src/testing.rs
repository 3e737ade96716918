//! Scripted providers for driving the pipeline without OCR binaries or network.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::extraction::{ExtractionOutput, TextExtractor, detect_container};
use crate::model::Document;
use crate::providers::{
    ActionPlanProvider, ActionPlanRequest, InterpretationProvider, InterpretationRequest,
    ProviderError, VisionProvider, VisionText,
};

/// A clean arterial report the quality gate accepts.
pub const CLEAN_REPORT: &str = "Blood gas analyzer report\npH 7.31\npCO2 52 mmHg\npO2 68 mmHg\nHCO3 25.8 mmol/L\nBE -1.2 mmol/L\nSO2 91 %\nLactate 1.1 mmol/L";

pub fn png_document() -> Document {
    Document::new(
        b"\x89PNG\r\n\x1a\nscripted".to_vec(),
        crate::model::DocumentKind::Arterial,
    )
    .with_mime_type("image/png")
    .with_file_name("abg.png")
}

/// Returns the same extraction output for every supported document.
pub struct ScriptedExtractor {
    output: ExtractionOutput,
}

impl ScriptedExtractor {
    pub fn text(text: &str, confidence: f32) -> Self {
        Self {
            output: ExtractionOutput {
                success: true,
                text: text.to_string(),
                confidence,
                error_message: None,
            },
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            output: ExtractionOutput::failed(message),
        }
    }
}

#[async_trait]
impl TextExtractor for ScriptedExtractor {
    async fn extract(&self, document: &Document) -> Result<ExtractionOutput> {
        detect_container(document)?;
        Ok(self.output.clone())
    }
}

/// Vision provider with a fixed answer and a call counter.
pub struct ScriptedVision {
    reply: std::result::Result<VisionText, ProviderError>,
    calls: AtomicUsize,
}

impl ScriptedVision {
    pub fn text(text: &str) -> Self {
        Self {
            reply: Ok(VisionText {
                text: text.to_string(),
                confidence: 0.9,
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn error(error: ProviderError) -> Self {
        Self {
            reply: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionProvider for ScriptedVision {
    async fn extract(
        &self,
        _document: &Document,
        _token: &CancellationToken,
    ) -> std::result::Result<VisionText, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }
}

/// Interpretation provider with a fixed reply, an optional delay and a record
/// of the requests it saw.
pub struct ScriptedInterpreter {
    reply: std::result::Result<String, ProviderError>,
    delay: Duration,
    requests: Mutex<Vec<InterpretationRequest>>,
}

impl ScriptedInterpreter {
    pub fn reply(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn error(error: ProviderError) -> Self {
        Self {
            reply: Err(error),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<InterpretationRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InterpretationProvider for ScriptedInterpreter {
    async fn interpret(
        &self,
        request: &InterpretationRequest,
        token: &CancellationToken,
    ) -> std::result::Result<String, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        tokio::select! {
            _ = token.cancelled() => Err(ProviderError::Cancelled),
            _ = tokio::time::sleep(self.delay) => self.reply.clone(),
        }
    }
}

/// Action-plan provider failing for the listed issue titles.
pub struct ScriptedPlanner {
    failing: Vec<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self {
            failing: Vec::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_for(titles: &[&str]) -> Self {
        Self {
            failing: titles.iter().map(|t| t.to_string()).collect(),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionPlanProvider for ScriptedPlanner {
    async fn generate(
        &self,
        request: &ActionPlanRequest,
        _correlation_id: &str,
        token: &CancellationToken,
    ) -> std::result::Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        if self.failing.contains(&request.issue_title) {
            Err(ProviderError::Http {
                status: 500,
                body: "scripted failure".to_string(),
            })
        } else {
            Ok(format!("1. Manage {}", request.issue_title))
        }
    }
}
