//! Shared fixtures for agent unit tests.

use std::sync::{Arc, Mutex};

use ai_client::{ChatRequest, ChatTransport, Completion, Gateway};
use anyhow::Result;
use briefwire_common::{Article, TokenUsage};
use chrono::Utc;

/// Transport that replays a fixed queue of responses; repeats the last one
/// when the queue runs dry.
pub struct ReplayTransport {
    responses: Mutex<Vec<String>>,
}

impl ReplayTransport {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
        }
    }
}

#[async_trait::async_trait]
impl ChatTransport for ReplayTransport {
    async fn send(&self, _request: &ChatRequest) -> Result<Completion> {
        let mut responses = self.responses.lock().unwrap();
        let text = if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("replay queue empty"))?
        };
        Ok(Completion {
            text,
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
            },
        })
    }
}

/// Transport that always errors, for failure-isolation tests.
pub struct FailingTransport;

#[async_trait::async_trait]
impl ChatTransport for FailingTransport {
    async fn send(&self, _request: &ChatRequest) -> Result<Completion> {
        anyhow::bail!("scripted transport failure")
    }
}

pub fn gateway_with_json(response: &str) -> Arc<Gateway> {
    Arc::new(Gateway::new(
        Arc::new(ReplayTransport::new(vec![response.to_string()])),
        "test-model",
    ))
}

pub fn gateway_with_responses(responses: Vec<String>) -> Arc<Gateway> {
    Arc::new(Gateway::new(
        Arc::new(ReplayTransport::new(responses)),
        "test-model",
    ))
}

pub fn failing_gateway() -> Arc<Gateway> {
    Arc::new(
        Gateway::new(Arc::new(FailingTransport), "test-model"),
    )
}

pub fn sample_article(url: &str) -> Article {
    Article {
        url: url.to_string(),
        title: "Example article title".to_string(),
        content: "Example article body with enough text to analyze.".to_string(),
        extracted_content: None,
        summary: "Example summary.".to_string(),
        source_name: "Example Wire".to_string(),
        category: "tech".to_string(),
        author: None,
        published_at: Some(Utc::now()),
        fetched_at: Utc::now(),
        sent_at: None,
    }
}
