use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use briefwire_common::TokenUsage;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{current_agent, current_session};
use crate::record::{truncate_content, AiCallRecord, CallParameters, CallSink};
use crate::recovery;
use crate::transport::ChatTransport;
use crate::types::{CallOptions, ChatMessage, ChatRequest, Completion};

const DEFAULT_RETRY_COUNT: u32 = 3;
const MAX_BACKOFF_SECS: u64 = 30;

/// The single funnel for model calls: retries, JSON recovery, token
/// accounting, and per-call telemetry all live here.
pub struct Gateway {
    transport: Arc<dyn ChatTransport>,
    sink: Option<Arc<dyn CallSink>>,
    model: String,
    max_tokens: u32,
    temperature: f64,
    max_content_length: usize,
}

impl Gateway {
    pub fn new(transport: Arc<dyn ChatTransport>, model: impl Into<String>) -> Self {
        Self {
            transport,
            sink: None,
            model: model.into(),
            max_tokens: 4096,
            temperature: 0.7,
            max_content_length: 10_000,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn CallSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_defaults(mut self, max_tokens: u32, temperature: f64) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn with_max_content_length(mut self, cap: usize) -> Self {
        self.max_content_length = cap;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Plain chat completion. Returns the response text and token usage.
    pub async fn chat(&self, messages: Vec<ChatMessage>, opts: CallOptions) -> Result<Completion> {
        self.call("chat", messages, opts).await
    }

    /// Chat completion with JSON recovery. A response that defeats all
    /// recovery strategies yields `None`, not an error; usage is still
    /// reported.
    pub async fn chat_json(
        &self,
        messages: Vec<ChatMessage>,
        opts: CallOptions,
    ) -> Result<(Option<Value>, TokenUsage)> {
        let opts = CallOptions {
            json_hint: true,
            ..opts
        };
        let completion = self.call("chat_json", messages, opts).await?;
        let parsed = recovery::parse_json(&completion.text);
        if parsed.is_none() {
            warn!(model = %self.model, "LLM response did not contain recoverable JSON");
        }
        Ok((parsed, completion.usage))
    }

    /// See [`recovery::parse_json`].
    pub fn parse_json(&self, text: &str) -> Option<Value> {
        recovery::parse_json(text)
    }

    /// Assemble a conversation: system prompt, optional few-shot examples as
    /// alternating user/assistant turns, then the user prompt.
    pub fn build_messages(
        system: impl Into<String>,
        user: impl Into<String>,
        examples: &[(String, String)],
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system)];
        for (example_in, example_out) in examples {
            messages.push(ChatMessage::user(example_in.clone()));
            messages.push(ChatMessage::assistant(example_out.clone()));
        }
        messages.push(ChatMessage::user(user));
        messages
    }

    async fn call(
        &self,
        call_type: &str,
        messages: Vec<ChatMessage>,
        opts: CallOptions,
    ) -> Result<Completion> {
        let retry_count = opts.retry_count.unwrap_or(DEFAULT_RETRY_COUNT).max(1);

        // The wire format carries no provider-specific JSON mode, so the
        // hint is a trailing system instruction.
        let mut wire_messages = messages.clone();
        if opts.json_hint {
            wire_messages.push(ChatMessage::system(
                "Respond with valid JSON only, no prose around it.",
            ));
        }
        let request = ChatRequest {
            model: self.model.clone(),
            messages: wire_messages,
            max_tokens: Some(opts.max_tokens.unwrap_or(self.max_tokens)),
            temperature: Some(opts.temperature.unwrap_or(self.temperature)),
        };

        let started = std::time::Instant::now();
        let mut last_error: Option<anyhow::Error> = None;
        let mut attempts = 0u32;

        for attempt in 0..retry_count {
            attempts = attempt + 1;
            if attempt > 0 {
                let backoff = Duration::from_secs(2u64.pow(attempt).min(MAX_BACKOFF_SECS));
                debug!(attempt, backoff_secs = backoff.as_secs(), "Retrying LLM call");
                tokio::time::sleep(backoff).await;
            }

            match self.transport.send(&request).await {
                Ok(completion) => {
                    self.record_call(
                        call_type,
                        &messages,
                        &request,
                        Some(&completion),
                        started.elapsed().as_millis() as i64,
                        attempts - 1,
                        None,
                    )
                    .await;
                    return Ok(completion);
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "LLM call failed");
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| anyhow::anyhow!("LLM call failed"));
        let error_text = format!("{error:#}");

        // A terminally failed call is still recorded, with zero usage.
        self.record_call(
            call_type,
            &messages,
            &request,
            None,
            started.elapsed().as_millis() as i64,
            attempts.saturating_sub(1),
            Some(error_text.clone()),
        )
        .await;

        Err(error).context("LLM call failed after retries")
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_call(
        &self,
        call_type: &str,
        messages: &[ChatMessage],
        request: &ChatRequest,
        completion: Option<&Completion>,
        duration_ms: i64,
        retry_count: u32,
        error: Option<String>,
    ) {
        let Some(sink) = &self.sink else { return };

        let cap = self.max_content_length;
        let stored_messages: Vec<ChatMessage> = messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.clone(),
                content: truncate_content(&m.content, cap),
            })
            .collect();

        let (response, usage) = match completion {
            Some(c) => (truncate_content(&c.text, cap), c.usage),
            None => (String::new(), TokenUsage::default()),
        };

        let record = AiCallRecord {
            call_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            call_type: call_type.to_string(),
            model: self.model.clone(),
            session_id: current_session(),
            agent_name: current_agent(),
            messages: stored_messages,
            parameters: CallParameters {
                max_tokens: request.max_tokens.unwrap_or_default(),
                temperature: request.temperature.unwrap_or_default(),
            },
            response,
            parsed_json: None,
            token_usage: usage,
            duration_ms,
            retry_count,
            error,
            caller: format!("gateway::{call_type}"),
        };

        // Telemetry failures never propagate into the call path.
        if let Err(e) = sink.record(record).await {
            warn!(error = %e, "Failed to record AI call telemetry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{with_agent, with_session};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Transport scripted with a queue of responses.
    struct ScriptedTransport {
        responses: Mutex<Vec<Result<Completion>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<Completion>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn ok(text: &str) -> Result<Completion> {
            Ok(Completion {
                text: text.to_string(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send(&self, _request: &ChatRequest) -> Result<Completion> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("script exhausted");
            }
            responses.remove(0)
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        records: Mutex<Vec<AiCallRecord>>,
    }

    #[async_trait]
    impl CallSink for CapturingSink {
        async fn record(&self, record: AiCallRecord) -> Result<()> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn gateway_with(
        responses: Vec<Result<Completion>>,
        sink: Arc<CapturingSink>,
    ) -> (Gateway, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(responses));
        let gateway = Gateway::new(transport.clone(), "test-model").with_sink(sink);
        (gateway, transport)
    }

    #[tokio::test]
    async fn chat_returns_text_and_usage() {
        let sink = Arc::new(CapturingSink::default());
        let (gateway, _) = gateway_with(vec![ScriptedTransport::ok("hello")], sink.clone());

        let completion = gateway
            .chat(vec![ChatMessage::user("hi")], CallOptions::default())
            .await
            .unwrap();

        assert_eq!(completion.text, "hello");
        assert_eq!(completion.usage.total_tokens, 15);
        assert_eq!(
            completion.usage.prompt_tokens + completion.usage.completion_tokens,
            completion.usage.total_tokens
        );
        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].call_type, "chat");
        assert_eq!(records[0].retry_count, 0);
        assert!(records[0].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let sink = Arc::new(CapturingSink::default());
        let (gateway, transport) = gateway_with(
            vec![
                Err(anyhow::anyhow!("transient")),
                Err(anyhow::anyhow!("transient")),
                ScriptedTransport::ok("third time"),
            ],
            sink.clone(),
        );

        let completion = gateway
            .chat(vec![ChatMessage::user("hi")], CallOptions::default())
            .await
            .unwrap();

        assert_eq!(completion.text, "third time");
        assert_eq!(*transport.calls.lock().unwrap(), 3);
        let records = sink.records.lock().unwrap();
        assert_eq!(records[0].retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_is_recorded_with_zero_usage() {
        let sink = Arc::new(CapturingSink::default());
        let (gateway, _) = gateway_with(
            vec![
                Err(anyhow::anyhow!("down")),
                Err(anyhow::anyhow!("down")),
                Err(anyhow::anyhow!("down")),
            ],
            sink.clone(),
        );

        let err = gateway
            .chat(vec![ChatMessage::user("hi")], CallOptions::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("after retries"));

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].error.is_some());
        assert_eq!(records[0].token_usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn chat_json_recovers_fenced_output() {
        let sink = Arc::new(CapturingSink::default());
        let (gateway, _) = gateway_with(
            vec![ScriptedTransport::ok("```json\n{\"k\": 1}\n```")],
            sink.clone(),
        );

        let (parsed, usage) = gateway
            .chat_json(vec![ChatMessage::user("hi")], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(parsed.unwrap()["k"], 1);
        assert_eq!(usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn chat_json_unparseable_yields_none_not_error() {
        let sink = Arc::new(CapturingSink::default());
        let (gateway, _) = gateway_with(vec![ScriptedTransport::ok("just prose")], sink.clone());

        let (parsed, usage) = gateway
            .chat_json(vec![ChatMessage::user("hi")], CallOptions::default())
            .await
            .unwrap();
        assert!(parsed.is_none());
        assert_eq!(usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn ambient_tags_flow_into_records() {
        let sink = Arc::new(CapturingSink::default());
        let (gateway, _) = gateway_with(vec![ScriptedTransport::ok("ok")], sink.clone());

        with_session("sess-42", async {
            with_agent("skeptic", async {
                gateway
                    .chat(vec![ChatMessage::user("hi")], CallOptions::default())
                    .await
                    .unwrap();
            })
            .await;
        })
        .await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records[0].session_id, "sess-42");
        assert_eq!(records[0].agent_name, "skeptic");
    }

    #[tokio::test]
    async fn long_content_is_truncated_in_records() {
        let sink = Arc::new(CapturingSink::default());
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedTransport::ok("short")]));
        let gateway = Gateway::new(transport, "test-model")
            .with_sink(sink.clone())
            .with_max_content_length(50);

        let long = "y".repeat(200);
        gateway
            .chat(vec![ChatMessage::user(long)], CallOptions::default())
            .await
            .unwrap();

        let records = sink.records.lock().unwrap();
        assert!(records[0].messages[0]
            .content
            .ends_with("[truncated, total 200 chars]"));
    }

    #[test]
    fn build_messages_interleaves_examples() {
        let messages = Gateway::build_messages(
            "system prompt",
            "the question",
            &[("ex in".to_string(), "ex out".to_string())],
        );
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1], ChatMessage::user("ex in"));
        assert_eq!(messages[2], ChatMessage::assistant("ex out"));
        assert_eq!(messages[3], ChatMessage::user("the question"));
    }
}
