//! Typed adapters over the loosely shaped provider responses.
//!
//! Providers answer with a bare string, an object carrying the text under one
//! of several field names, or a list of such objects. These helpers never fail:
//! when nothing matches, the whole payload is serialized.

use serde_json::Value;

/// Field names checked, in order, after any provider-specific ones.
pub const TEXT_FIELDS: [&str; 6] = ["text", "output", "data", "message", "response", "result"];

const MAX_DEPTH: usize = 4;

/// Text carried by `payload`, trying `preferred` fields before [`TEXT_FIELDS`].
pub fn extract_text(payload: &Value, preferred: &[&str]) -> String {
    find_text(payload, preferred, 0).unwrap_or_else(|| match payload {
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn find_text(value: &Value, preferred: &[&str], depth: usize) -> Option<String> {
    if depth > MAX_DEPTH {
        return None;
    }
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => items
            .first()
            .and_then(|first| find_text(first, preferred, depth + 1)),
        Value::Object(map) => preferred
            .iter()
            .chain(TEXT_FIELDS.iter())
            .filter_map(|field| map.get(*field))
            .find_map(|field_value| find_text(field_value, preferred, depth + 1)),
        _ => None,
    }
}

/// A `confidence` number in 0-1 (or 0-100) on the payload or its first element.
pub fn extract_confidence(payload: &Value) -> Option<f32> {
    let value = match payload {
        Value::Array(items) => items.first()?.get("confidence")?,
        Value::Object(map) => map.get("confidence")?,
        _ => return None,
    };
    let raw = value.as_f64()? as f32;
    let normalized = if raw > 1.0 { raw / 100.0 } else { raw };
    Some(normalized.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_string_body() {
        assert_eq!(extract_text(&json!("hello"), &[]), "hello");
    }

    #[test]
    fn each_known_field_is_found() {
        for field in TEXT_FIELDS {
            let payload = json!({ field: "found", "other": 1 });
            assert_eq!(extract_text(&payload, &[]), "found", "{field}");
        }
    }

    #[test]
    fn preferred_fields_win() {
        let payload = json!({ "text": "generic", "planText": "specific" });
        assert_eq!(extract_text(&payload, &["planText"]), "specific");
    }

    #[test]
    fn nested_and_listed_payloads() {
        assert_eq!(
            extract_text(&json!([{ "output": "from list" }]), &[]),
            "from list"
        );
        assert_eq!(
            extract_text(&json!({ "data": { "result": "deep" } }), &[]),
            "deep"
        );
    }

    #[test]
    fn unknown_shape_falls_back_to_serialized_payload() {
        let payload = json!({ "unexpected": 42 });
        assert_eq!(extract_text(&payload, &[]), r#"{"unexpected":42}"#);
        assert_eq!(extract_text(&Value::Null, &[]), "");
    }

    #[test]
    fn non_string_field_does_not_short_circuit() {
        let payload = json!({ "text": 5, "output": "real" });
        assert_eq!(extract_text(&payload, &[]), "real");
    }

    #[test]
    fn confidence_is_normalized() {
        assert_eq!(extract_confidence(&json!({ "confidence": 0.8 })), Some(0.8));
        assert_eq!(extract_confidence(&json!([{ "confidence": 85 }])), Some(0.85));
        assert_eq!(extract_confidence(&json!("text")), None);
    }
}
