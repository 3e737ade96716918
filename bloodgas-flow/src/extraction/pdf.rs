use async_trait::async_trait;

use super::ExtractionError;

/// Text embedded in a PDF and the confidence we assign to it.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfText {
    pub text: String,
    pub confidence: f32,
}

/// Reads the embedded text layer of a PDF.
#[async_trait]
pub trait PdfTextLayer: Send + Sync {
    async fn extract(&self, pdf: &[u8]) -> Result<PdfText, ExtractionError>;
}

/// Text layer reader backed by the `pdf-extract` crate.
pub struct PdfExtractLayer;

/// Fewer non-whitespace characters than this means "no text layer".
const MIN_TEXT_LAYER_CHARS: usize = 10;
const TEXT_LAYER_CONFIDENCE: f32 = 0.95;

#[async_trait]
impl PdfTextLayer for PdfExtractLayer {
    async fn extract(&self, pdf: &[u8]) -> Result<PdfText, ExtractionError> {
        let bytes = pdf.to_vec();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| ExtractionError::PdfParsing(format!("extraction task failed: {e}")))?
            .map_err(|e| ExtractionError::PdfParsing(e.to_string()))?;

        Ok(PdfText {
            confidence: text_layer_confidence(&text),
            text,
        })
    }
}

pub fn text_layer_confidence(text: &str) -> f32 {
    let chars = text.chars().filter(|c| !c.is_whitespace()).count();
    if chars > MIN_TEXT_LAYER_CHARS {
        TEXT_LAYER_CONFIDENCE
    } else {
        0.0
    }
}
