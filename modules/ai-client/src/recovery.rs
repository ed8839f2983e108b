//! JSON recovery for model responses that fail direct parsing.

use serde_json::Value;

/// Best-effort extraction of a JSON value from model output.
///
/// Strategies, in order:
/// 1. Parse the text directly.
/// 2. Parse the first fenced ```json (or bare ```) block.
/// 3. Parse the longest `{ ... }` span.
///
/// Returns `None` when nothing parses; never panics.
pub fn parse_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(block) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(block.trim()) {
            return Some(value);
        }
    }

    if let Some(span) = extract_brace_span(trimmed) {
        if let Ok(value) = serde_json::from_str(span) {
            return Some(value);
        }
    }

    None
}

/// First fenced code block, preferring an explicit ```json fence.
fn extract_fenced_block(text: &str) -> Option<&str> {
    for marker in ["```json", "```"] {
        if let Some(start) = text.find(marker) {
            let body = &text[start + marker.len()..];
            if let Some(end) = body.find("```") {
                return Some(&body[..end]);
            }
        }
    }
    None
}

/// Longest span from the first `{` to the last `}`.
fn extract_brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}
