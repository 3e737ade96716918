pub mod ocr;
pub mod pdf;
pub mod quality;

pub use ocr::{OcrEngine, OcrPage, TesseractCli};
pub use pdf::{PdfExtractLayer, PdfText, PdfTextLayer};
pub use quality::{QualityReport, QualityThresholds, QualityValidator};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    error::{FlowError, Result},
    model::Document,
};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OCR engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Image,
    Pdf,
}

/// Work out the container from magic bytes, then from the declared MIME type.
pub fn detect_container(document: &Document) -> Result<ContainerFormat> {
    let bytes = document.bytes.as_slice();
    if bytes.starts_with(b"%PDF") {
        return Ok(ContainerFormat::Pdf);
    }
    const IMAGE_MAGIC: &[&[u8]] = &[
        b"\x89PNG\r\n\x1a\n",
        b"\xFF\xD8\xFF",
        b"GIF87a",
        b"GIF89a",
        b"BM",
        b"II*\0",
        b"MM\0*",
    ];
    if IMAGE_MAGIC.iter().any(|magic| bytes.starts_with(magic))
        || (bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP")
    {
        return Ok(ContainerFormat::Image);
    }

    match document.mime_type.as_deref() {
        Some("application/pdf") => Ok(ContainerFormat::Pdf),
        Some(mime) if mime.starts_with("image/") => Ok(ContainerFormat::Image),
        Some(mime) => Err(FlowError::UnsupportedFormat(mime.to_string())),
        None => Err(FlowError::UnsupportedFormat("unknown".to_string())),
    }
}

/// Outcome of the free local extraction pass.
///
/// Recoverable problems are reported through `success = false` and
/// `error_message`, never as an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutput {
    pub success: bool,
    pub text: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExtractionOutput {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            text: String::new(),
            confidence: 0.0,
            error_message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Only an unsupported container is an error.
    async fn extract(&self, document: &Document) -> Result<ExtractionOutput>;
}

/// Raster OCR for images, text-layer extraction for PDFs.
pub struct LocalExtractor {
    ocr: Arc<dyn OcrEngine>,
    pdf: Arc<dyn PdfTextLayer>,
}

impl LocalExtractor {
    pub fn new(ocr: Arc<dyn OcrEngine>, pdf: Arc<dyn PdfTextLayer>) -> Self {
        Self { ocr, pdf }
    }
}

impl Default for LocalExtractor {
    fn default() -> Self {
        Self::new(Arc::new(TesseractCli::new()), Arc::new(PdfExtractLayer))
    }
}

#[async_trait]
impl TextExtractor for LocalExtractor {
    async fn extract(&self, document: &Document) -> Result<ExtractionOutput> {
        let format = detect_container(document)?;
        info!(
            ?format,
            kind = document.kind.as_str(),
            bytes = document.bytes.len(),
            "Starting local text extraction"
        );

        let output = match format {
            ContainerFormat::Image => match self.ocr.recognize(&document.bytes).await {
                Ok(page) if page.text.trim().is_empty() => {
                    ExtractionOutput::failed("OCR found no text in the image")
                }
                Ok(page) => ExtractionOutput {
                    success: true,
                    text: page.text,
                    confidence: page.confidence,
                    error_message: None,
                },
                Err(e) => {
                    warn!("Local OCR failed: {}", e);
                    ExtractionOutput::failed(e.to_string())
                }
            },
            ContainerFormat::Pdf => match self.pdf.extract(&document.bytes).await {
                Ok(pdf) if pdf.confidence > 0.0 => ExtractionOutput {
                    success: true,
                    text: pdf.text,
                    confidence: pdf.confidence,
                    error_message: None,
                },
                Ok(_) => ExtractionOutput::failed("PDF has no embedded text layer"),
                Err(e) => {
                    warn!("PDF text extraction failed: {}", e);
                    ExtractionOutput::failed(e.to_string())
                }
            },
        };

        info!(
            success = output.success,
            confidence = output.confidence,
            chars = output.text.len(),
            "Local text extraction finished"
        );
        Ok(output)
    }
}
