//! Issue extraction from interpretation text.
//!
//! Interpretations may end with a fenced JSON block listing the clinical
//! problems found. Anything malformed yields an empty list, never an error.

use serde::Deserialize;
use serde_json::Value;
use std::ops::Range;
use tracing::{debug, warn};

use crate::model::Issue;

const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedIssues {
    pub issues: Vec<Issue>,
    pub count: usize,
    /// Input with the issue block removed. Identical to the input when no
    /// block was found.
    pub stripped_text: String,
}

/// Split `text` into issues and the surrounding prose.
pub fn parse_issues(text: &str) -> ParsedIssues {
    let Some((range, body)) = find_issue_block(text) else {
        return ParsedIssues {
            issues: Vec::new(),
            count: 0,
            stripped_text: text.to_string(),
        };
    };

    let issues = decode_issues(body);
    debug!(count = issues.len(), "Parsed issue block");
    ParsedIssues {
        count: issues.len(),
        issues,
        stripped_text: strip_range(text, range),
    }
}

/// `text` with the issue block removed, if it has one.
pub fn strip_issue_block(text: &str) -> String {
    match find_issue_block(text) {
        Some((range, _)) => strip_range(text, range),
        None => text.to_string(),
    }
}

/// First fenced block whose body looks like JSON. Every pair of consecutive
/// fences is a candidate, so a stray fence earlier in the prose cannot swallow
/// the real block. A `json` tag wins over an untagged fence.
fn find_issue_block(text: &str) -> Option<(Range<usize>, &str)> {
    let fences: Vec<usize> = text.match_indices(FENCE).map(|(i, _)| i).collect();
    let mut untagged = None;
    for pair in fences.windows(2) {
        let (open, close) = (pair[0], pair[1]);
        let info = text[open + FENCE.len()..close].trim_start_matches([' ', '\t']);
        let tag_len = info
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(info.len());
        let (tag, body) = info.split_at(tag_len);
        if !tag.is_empty() && !tag.eq_ignore_ascii_case("json") {
            continue;
        }
        let body = body.trim();
        if !(body.starts_with('[') || body.starts_with('{')) {
            continue;
        }
        let block = (open..close + FENCE.len(), body);
        if !tag.is_empty() {
            return Some(block);
        }
        untagged.get_or_insert(block);
    }
    untagged
}

fn strip_range(text: &str, range: Range<usize>) -> String {
    let before = text[..range.start].trim_end();
    let after = text[range.end..].trim_start();
    match (before.is_empty(), after.is_empty()) {
        (true, _) => after.to_string(),
        (_, true) => before.to_string(),
        _ => format!("{before}\n\n{after}"),
    }
}

#[derive(Deserialize)]
struct IssueEnvelope {
    issues: Vec<Value>,
}

fn decode_issues(body: &str) -> Vec<Issue> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            warn!("Issue block is not valid JSON: {}", e);
            return Vec::new();
        }
    };

    let entries = match value {
        Value::Array(entries) => entries,
        object @ Value::Object(_) => match serde_json::from_value::<IssueEnvelope>(object) {
            Ok(envelope) => envelope.issues,
            Err(_) => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<Issue>(entry).ok())
        .filter(|issue| !issue.title.trim().is_empty())
        .collect()
}
