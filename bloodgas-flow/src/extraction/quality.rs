//! Rule-based plausibility scoring for extracted blood-gas text.
//!
//! Decides whether free OCR output is good enough to skip the paid vision pass.
//! Escalation is the default whenever the evidence is ambiguous.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub min_length: usize,
    pub short_text_penalty: f32,
    pub no_parameter_penalty: f32,
    pub min_parameter_matches: usize,
    pub few_parameter_penalty: f32,
    pub min_numeric_tokens: usize,
    pub few_numeric_penalty: f32,
    pub keyword_bonus: f32,
    pub noise_ratio_limit: f32,
    pub noise_penalty: f32,
    pub max_token_length: usize,
    pub long_token_penalty: f32,
    /// Escalate when the score is below this.
    pub escalate_below: f32,
    /// Escalate when the score is below this and matches are below `weak_match_count`.
    pub weak_score_below: f32,
    pub weak_match_count: usize,
    pub escalate_min_trimmed_length: usize,
    pub escalate_noise_ratio: f32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_length: 20,
            short_text_penalty: 0.4,
            no_parameter_penalty: 0.5,
            min_parameter_matches: 3,
            few_parameter_penalty: 0.3,
            min_numeric_tokens: 3,
            few_numeric_penalty: 0.3,
            keyword_bonus: 0.1,
            noise_ratio_limit: 0.3,
            noise_penalty: 0.2,
            max_token_length: 25,
            long_token_penalty: 0.2,
            escalate_below: 0.5,
            weak_score_below: 0.7,
            weak_match_count: 2,
            escalate_min_trimmed_length: 30,
            escalate_noise_ratio: 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub quality_score: f32,
    pub should_escalate: bool,
    pub parameter_matches: usize,
    pub numeric_tokens: usize,
    pub noise_ratio: f32,
    pub has_report_keyword: bool,
    pub issues: Vec<String>,
}

static PARAMETER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // pH
        r"(?i)\bph\s*[:=]?\s*\d+[.,]\d+",
        // pCO2
        r"(?i)\bp\s*co\s*2\b\s*[:=]?\s*\d+(?:[.,]\d+)?",
        // pO2
        r"(?i)\bp\s*o\s*2\b\s*[:=]?\s*\d+(?:[.,]\d+)?",
        // HCO3 / bicarbonate
        r"(?i)\b(?:hco\s*3|bicarb(?:onate)?)\s*-?\s*(?:\(\w+\))?\s*[:=]?\s*\d+(?:[.,]\d+)?",
        // base excess
        r"(?i)\b(?:base\s+excess|be(?:ecf|b)?)\s*[:=]?\s*[-+]?\d+(?:[.,]\d+)?",
        // SO2
        r"(?i)\bs\s*o\s*2\b\s*[:=]?\s*\d+(?:[.,]\d+)?",
        // SpO2
        r"(?i)\bsp\s*o\s*2\b\s*[:=]?\s*\d+(?:[.,]\d+)?",
        // any value with a blood-gas unit
        r"(?i)\d+(?:[.,]\d+)?\s*(?:mmhg|kpa|mmol/l|meq/l|mg/dl|g/dl|%)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static NUMERIC_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)?").ok());

const REPORT_KEYWORDS: &[&str] = &[
    "blood gas",
    "abg",
    "vbg",
    "radiometer",
    "abl",
    "gem premier",
    "i-stat",
    "istat",
    "epoc",
    "cobas",
    "rapidpoint",
    "rapidlab",
    "analyzer",
    "analyser",
    "arterial",
    "venous",
    "oximetry",
    "electrolytes",
];

const REPORT_PUNCTUATION: &[char] = &[
    '.', ',', ':', ';', '/', '%', '-', '+', '(', ')', '<', '>', '=', '^', '*', '#',
];

/// Scores extracted text and decides whether to escalate to vision.
#[derive(Debug, Clone, Default)]
pub struct QualityValidator {
    thresholds: QualityThresholds,
}

impl QualityValidator {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    pub fn evaluate(&self, text: &str) -> QualityReport {
        let t = &self.thresholds;
        let mut score: f32 = 1.0;
        let mut issues = Vec::new();

        let length = text.chars().count();
        if length < t.min_length {
            score -= t.short_text_penalty;
            issues.push(format!("Text too short ({length} characters)"));
        }

        let parameter_matches = count_parameter_matches(text);
        if parameter_matches == 0 {
            score -= t.no_parameter_penalty;
            issues.push("No blood-gas parameters recognised".to_string());
        } else if parameter_matches < t.min_parameter_matches {
            score -= t.few_parameter_penalty;
            issues.push(format!(
                "Only {parameter_matches} blood-gas parameters recognised"
            ));
        }

        let numeric_tokens = count_numeric_tokens(text);
        if numeric_tokens < t.min_numeric_tokens {
            score -= t.few_numeric_penalty;
            issues.push(format!("Only {numeric_tokens} numeric values found"));
        }

        let has_report_keyword = contains_report_keyword(text);
        if has_report_keyword {
            score += t.keyword_bonus;
        }

        let noise_ratio = noise_ratio(text);
        if noise_ratio > t.noise_ratio_limit {
            score -= t.noise_penalty;
            issues.push(format!("High noise ratio ({:.0}%)", noise_ratio * 100.0));
        }

        if let Some(longest) = text
            .split_whitespace()
            .map(|token| token.chars().count())
            .max()
            .filter(|len| *len > t.max_token_length)
        {
            score -= t.long_token_penalty;
            issues.push(format!("Run-on token of {longest} characters"));
        }

        let quality_score = score.clamp(0.0, 1.0);
        let trimmed_length = text.trim().chars().count();

        let should_escalate = quality_score < t.escalate_below
            || (quality_score < t.weak_score_below && parameter_matches < t.weak_match_count)
            || trimmed_length < t.escalate_min_trimmed_length
            || noise_ratio > t.escalate_noise_ratio;

        QualityReport {
            quality_score,
            should_escalate,
            parameter_matches,
            numeric_tokens,
            noise_ratio,
            has_report_keyword,
            issues,
        }
    }
}

fn count_parameter_matches(text: &str) -> usize {
    PARAMETER_PATTERNS
        .iter()
        .map(|pattern| pattern.find_iter(text).count())
        .sum()
}

fn count_numeric_tokens(text: &str) -> usize {
    NUMERIC_TOKEN
        .as_ref()
        .map(|pattern| pattern.find_iter(text).count())
        .unwrap_or(0)
}

fn contains_report_keyword(text: &str) -> bool {
    let lowered = text.to_lowercase();
    REPORT_KEYWORDS.iter().any(|keyword| {
        lowered
            .match_indices(keyword)
            .any(|(start, _)| is_word_boundary(&lowered, start, keyword.len()))
    })
}

fn is_word_boundary(text: &str, start: usize, len: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[start + len..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

fn noise_ratio(text: &str) -> f32 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let noise = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && !REPORT_PUNCTUATION.contains(c))
        .count();
    noise as f32 / total as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "pH 7.35 pCO2 45 mmHg pO2 90 mmHg HCO3 24 mmol/L";

    #[test]
    fn clean_sample_is_trusted() {
        let report = QualityValidator::default().evaluate(SAMPLE);
        assert!(report.parameter_matches >= 4, "{report:?}");
        assert!(!report.should_escalate, "{report:?}");
        assert_eq!(report.quality_score, 1.0);
    }

    #[test]
    fn short_text_always_escalates() {
        let validator = QualityValidator::default();
        for text in ["", "pH 7.35", "pCO2 45 mmHg pO2 9", "abc"] {
            assert!(text.chars().count() < 20);
            assert!(validator.evaluate(text).should_escalate, "{text}");
        }
    }

    #[test]
    fn score_is_bounded_and_deterministic() {
        let validator = QualityValidator::default();
        let inputs = [
            "",
            "@@@@ #### $$$$ &&&&",
            SAMPLE,
            "Radiometer ABL90 arterial blood gas pH 7.41 pCO2 39 mmHg pO2 95 mmHg HCO3 24.1 mmol/L BE -0.5 sO2 97 %",
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        ];
        for text in inputs {
            let first = validator.evaluate(text);
            let second = validator.evaluate(text);
            assert_eq!(first, second);
            assert!((0.0..=1.0).contains(&first.quality_score), "{text}");
        }
    }

    #[test]
    fn noise_escalates() {
        let text = "pH 7.35 ~~~ pCO2 ¬¬¬ 45 mmHg ||| pO2 @@@ 90 $$$ mmHg &&& HCO3 ??? 24 ~~~~~~";
        let report = QualityValidator::default().evaluate(text);
        assert!(report.noise_ratio > 0.3, "{report:?}");
        assert!(report.issues.iter().any(|i| i.contains("noise")));
    }

    #[test]
    fn run_on_token_is_penalised() {
        let text = format!("{SAMPLE} abcdefghijklmnopqrstuvwxyz0123");
        let report = QualityValidator::default().evaluate(&text);
        assert!(report.quality_score < 1.0);
        assert!(report.issues.iter().any(|i| i.contains("Run-on")));
    }

    #[test]
    fn keyword_bonus_is_clamped() {
        let text = format!("Arterial blood gas report {SAMPLE}");
        let report = QualityValidator::default().evaluate(&text);
        assert!(report.has_report_keyword);
        assert_eq!(report.quality_score, 1.0);
    }

    #[test]
    fn keyword_needs_word_boundary() {
        assert!(!contains_report_keyword("fabulous stable"));
        assert!(contains_report_keyword("ABL 800 FLEX"));
    }

    #[test]
    fn prose_without_parameters_escalates() {
        let text = "The quick brown fox jumps over the lazy dog near the river bank today.";
        let report = QualityValidator::default().evaluate(text);
        assert_eq!(report.parameter_matches, 0);
        assert!(report.should_escalate);
    }

    #[test]
    fn thresholds_are_configurable() {
        let strict = QualityValidator::new(QualityThresholds {
            escalate_below: 1.1,
            ..QualityThresholds::default()
        });
        assert!(strict.evaluate(SAMPLE).should_escalate);
    }
}
