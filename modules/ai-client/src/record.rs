use briefwire_common::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ChatMessage;

/// Full record of a single model call, as written to the telemetry log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiCallRecord {
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    /// "chat" or "chat_json".
    pub call_type: String,
    pub model: String,
    pub session_id: String,
    pub agent_name: String,
    pub messages: Vec<ChatMessage>,
    pub parameters: CallParameters,
    pub response: String,
    pub parsed_json: Option<serde_json::Value>,
    pub token_usage: TokenUsage,
    pub duration_ms: i64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub caller: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CallParameters {
    pub max_tokens: u32,
    pub temperature: f64,
}

/// Truncate content for storage, marking the original length.
pub fn truncate_content(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let total = text.chars().count();
    let kept: String = text.chars().take(cap).collect();
    format!("{kept}[truncated, total {total} chars]")
}

/// Sink for completed call records. Implemented by the telemetry recorder;
/// injected into the gateway so there is no global registry.
#[async_trait::async_trait]
pub trait CallSink: Send + Sync {
    async fn record(&self, record: AiCallRecord) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_marks_original_length() {
        let text = "x".repeat(120);
        let out = truncate_content(&text, 100);
        assert!(out.starts_with(&"x".repeat(100)));
        assert!(out.ends_with("[truncated, total 120 chars]"));
    }

    #[test]
    fn short_content_untouched() {
        assert_eq!(truncate_content("hello", 100), "hello");
    }
}
