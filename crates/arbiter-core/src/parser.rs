use serde_json::Value;

use arbiter_types::{DecisionContract, ParseStatus};

pub const PARSER_VERSION: &str = "1.0.0";

/// Outcome of parsing one trial's final assistant text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub status: ParseStatus,
    pub outcome: Option<String>,
    pub rationale: Option<String>,
    pub confidence: Option<f64>,
    pub extraction_method: Option<String>,
}

impl ParseResult {
    pub fn failed() -> Self {
        Self {
            status: ParseStatus::Failed,
            outcome: None,
            rationale: None,
            confidence: None,
            extraction_method: None,
        }
    }
}

/// Parse the raw assistant text. With a decision contract the text must carry
/// a JSON object exposing `outcome`; without one, any non-empty text is the
/// outcome itself.
pub fn parse_assistant_text(raw: &str, contract: Option<&DecisionContract>) -> ParseResult {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ParseResult::failed();
    }

    if contract.is_none() {
        return ParseResult {
            status: ParseStatus::Success,
            outcome: Some(trimmed.to_string()),
            rationale: None,
            confidence: None,
            extraction_method: Some("plain_text".to_string()),
        };
    }

    if let Some((value, method)) = extract_json_object(trimmed) {
        if let Some(result) = contract_result(&value, method) {
            return result;
        }
    }

    // No usable structured output; fall back to the raw content.
    ParseResult {
        status: ParseStatus::Fallback,
        outcome: Some(trimmed.to_string()),
        rationale: None,
        confidence: None,
        extraction_method: Some("raw_content".to_string()),
    }
}

fn contract_result(value: &Value, method: &'static str) -> Option<ParseResult> {
    let outcome = match value.get("outcome")? {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::String(_) => return None,
        other => other.to_string(),
    };
    Some(ParseResult {
        status: ParseStatus::Success,
        outcome: Some(outcome),
        rationale: value
            .get("rationale")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        confidence: value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .filter(|c| (0.0..=1.0).contains(c)),
        extraction_method: Some(method.to_string()),
    })
}

/// Try, in order: the whole text as JSON, a fenced code block, the first
/// balanced `{...}` span.
fn extract_json_object(text: &str) -> Option<(Value, &'static str)> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() {
            return Some((value, "json_direct"));
        }
    }

    if let Some(block) = fenced_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            if value.is_object() {
                return Some((value, "json_fenced"));
            }
        }
    }

    if let Some(span) = balanced_object_span(text) {
        if let Ok(value) = serde_json::from_str::<Value>(span) {
            if value.is_object() {
                return Some((value, "json_span"));
            }
        }
    }

    None
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn balanced_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEmbedText {
    pub text: String,
    pub was_empty: bool,
}

/// EMBED_TEXT_NORMALIZATION: lower-case, collapse whitespace runs to single
/// spaces, then truncate by character count.
pub fn prepare_embed_text(text: &str, max_chars: usize) -> PreparedEmbedText {
    let normalized = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let truncated: String = normalized.chars().take(max_chars).collect();
    PreparedEmbedText {
        was_empty: truncated.is_empty(),
        text: truncated,
    }
}
