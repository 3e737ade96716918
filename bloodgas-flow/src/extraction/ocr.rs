use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ExtractionError;

/// One recognised word with its confidence in 0.0-1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    pub confidence: f32,
    pub line_key: (u32, u32, u32, u32),
}

/// Raw OCR output for a single image.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrPage {
    pub text: String,
    pub confidence: f32,
    pub words: Vec<OcrWord>,
}

/// Local optical character recognition over raster image bytes.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<OcrPage, ExtractionError>;
}

/// Drives the `tesseract` command-line tool in TSV mode.
pub struct TesseractCli {
    binary: PathBuf,
    languages: String,
}

impl TesseractCli {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            languages: "eng".to_string(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Languages in tesseract syntax, e.g. `eng+deu`.
    pub fn with_languages(mut self, languages: impl Into<String>) -> Self {
        self.languages = languages.into();
        self
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for TesseractCli {
    async fn recognize(&self, image: &[u8]) -> Result<OcrPage, ExtractionError> {
        let input = std::env::temp_dir().join(format!("bloodgas-ocr-{}", Uuid::new_v4()));
        tokio::fs::write(&input, image).await?;

        let output = Command::new(&self.binary)
            .arg(&input)
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages)
            .arg("tsv")
            .stdin(Stdio::null())
            .output()
            .await;

        if let Err(e) = tokio::fs::remove_file(&input).await {
            warn!(path = %input.display(), "Failed to remove OCR temp file: {}", e);
        }

        let output = output.map_err(|e| {
            ExtractionError::EngineUnavailable(format!("{}: {}", self.binary.display(), e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractionError::OcrProcessing(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let page = page_from_tsv(&tsv);
        debug!(
            words = page.words.len(),
            confidence = page.confidence,
            "Tesseract recognition finished"
        );
        Ok(page)
    }
}

/// Parse tesseract TSV output.
///
/// Columns: level page block par line word left top width height conf text.
/// Only level 5 rows are words. Confidence is 0-100; -1 means unknown and
/// counts as 0.
pub fn parse_tsv_words(tsv: &str) -> Vec<OcrWord> {
    let mut words = Vec::new();

    for line in tsv.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 || fields[0].trim() != "5" {
            continue;
        }

        let text = fields[11].trim();
        if text.is_empty() {
            continue;
        }

        let Ok(conf) = fields[10].trim().parse::<f32>() else {
            continue;
        };
        let key = |i: usize| fields[i].trim().parse::<u32>().unwrap_or(0);

        words.push(OcrWord {
            text: text.to_string(),
            confidence: (conf / 100.0).clamp(0.0, 1.0),
            line_key: (key(1), key(2), key(3), key(4)),
        });
    }

    words
}

/// Rebuild text (one output line per OCR line) and the mean word confidence.
pub fn page_from_tsv(tsv: &str) -> OcrPage {
    let words = parse_tsv_words(tsv);

    let mut lines: Vec<String> = Vec::new();
    let mut current_key = None;
    for word in &words {
        if current_key == Some(word.line_key) {
            if let Some(line) = lines.last_mut() {
                line.push(' ');
                line.push_str(&word.text);
            }
        } else {
            lines.push(word.text.clone());
            current_key = Some(word.line_key);
        }
    }

    let confidence = if words.is_empty() {
        0.0
    } else {
        words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
    };

    OcrPage {
        text: lines.join("\n"),
        confidence,
        words,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t
4\t1\t1\t1\t1\t0\t10\t10\t300\t20\t-1\t
5\t1\t1\t1\t1\t1\t10\t10\t30\t20\t96.5\tpH
5\t1\t1\t1\t1\t2\t50\t10\t40\t20\t91\t7.35
5\t1\t1\t1\t2\t1\t10\t40\t60\t20\t88\tpCO2
5\t1\t1\t1\t2\t2\t80\t40\t30\t20\t-1\t45
5\t1\t1\t1\t2\t3\t120\t40\t30\t20\t90\t
";

    #[test]
    fn words_skip_non_word_levels_and_blanks() {
        let words = parse_tsv_words(TSV);
        assert_eq!(words.len(), 4);
        assert_eq!(words[0].text, "pH");
        assert!((words[0].confidence - 0.965).abs() < 1e-4);
        assert_eq!(words[3].confidence, 0.0);
    }

    #[test]
    fn page_rebuilds_lines() {
        let page = page_from_tsv(TSV);
        assert_eq!(page.text, "pH 7.35\npCO2 45");
        let expected = (0.965 + 0.91 + 0.88 + 0.0) / 4.0;
        assert!((page.confidence - expected).abs() < 1e-4);
    }

    #[test]
    fn empty_tsv_has_zero_confidence() {
        let page = page_from_tsv("");
        assert!(page.text.is_empty());
        assert_eq!(page.confidence, 0.0);
    }

    #[tokio::test]
    async fn missing_binary_is_engine_unavailable() {
        let engine = TesseractCli::new().with_binary("/nonexistent/tesseract-binary");
        let err = engine.recognize(b"not an image").await.unwrap_err();
        assert!(matches!(err, ExtractionError::EngineUnavailable(_)));
    }
}
