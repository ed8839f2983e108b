use std::sync::Arc;

use ai_client::{with_agent, CallOptions, Gateway};
use briefwire_common::{Article, FiveW1H};
use serde::Deserialize;
use tracing::warn;

use crate::context::{AnalysisContext, CollectedEntity, TimelineEvent};
use crate::normalize::{clean_article_text, truncate_for_prompt};
use crate::traits::{summarize, AgentOutput, TraceBuilder};

const NAME: &str = "collector";
const MAX_PROMPT_BYTES: usize = 30_000;

const SYSTEM_PROMPT: &str = r#"You are a news information collector.

Given one article, extract the factual skeleton as JSON:

{
  "who": ["actors involved"],
  "what": "what happened, one sentence",
  "when": "when it happened, as stated",
  "where": "where it happened",
  "why": "why it happened / motivation",
  "how": "how it happened / mechanism",
  "entities": [{"name": "...", "type": "COMPANY|PERSON|PRODUCT|ORG|CONCEPT|LOCATION|EVENT", "description": "one line"}],
  "timeline": [{"time": "...", "event": "...", "impact": "..."}],
  "core_summary": "2-3 sentence neutral summary"
}

Report only what the article states. Leave fields empty when the article is
silent. Respond with JSON only."#;

#[derive(Debug, Clone, Deserialize, Default)]
struct CollectorResponse {
    #[serde(default)]
    who: Vec<String>,
    #[serde(default)]
    what: String,
    #[serde(default)]
    when: String,
    #[serde(default, rename = "where")]
    where_: String,
    #[serde(default)]
    why: String,
    #[serde(default)]
    how: String,
    #[serde(default)]
    entities: Vec<CollectedEntity>,
    #[serde(default)]
    timeline: Vec<TimelineEvent>,
    #[serde(default)]
    core_summary: String,
}

#[derive(Debug, Clone, Default)]
pub struct CollectorOutput {
    pub five_w1h: FiveW1H,
    pub entities: Vec<CollectedEntity>,
    pub timeline: Vec<TimelineEvent>,
    pub core_summary: String,
    pub cleaned_content: String,
}

/// Distills an article into 5W1H, entities, and a timeline. Always the first
/// agent to run; it also owns content normalization.
pub struct Collector {
    gateway: Arc<Gateway>,
}

impl Collector {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    pub async fn process(
        &self,
        article: &Article,
        context: &mut AnalysisContext,
    ) -> AgentOutput<CollectorOutput> {
        let mut trace = TraceBuilder::start(NAME, summarize(&article.title, 120));

        let cleaned = clean_article_text(article.best_content());
        context.cleaned_content = cleaned.clone();

        let user_prompt = format!(
            "Title: {}\nSource: {}\n\n{}",
            article.title,
            article.source_name,
            truncate_for_prompt(&cleaned, MAX_PROMPT_BYTES),
        );
        let messages = Gateway::build_messages(SYSTEM_PROMPT, user_prompt, &[]);

        let result = with_agent(NAME, self.gateway.chat_json(messages, CallOptions::default())).await;

        let mut output = CollectorOutput {
            cleaned_content: cleaned,
            ..Default::default()
        };

        match result {
            Ok((parsed, usage)) => {
                trace.add_usage(&usage);
                let response: CollectorResponse = match parsed {
                    Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                        warn!(url = article.url, error = %e, "Collector JSON did not match schema");
                        trace.warn(format!("schema mismatch: {e}"));
                        CollectorResponse::default()
                    }),
                    None => {
                        // Unparseable output degrades to empty fields, not a
                        // failed agent.
                        trace.warn("no recoverable JSON in response");
                        CollectorResponse::default()
                    }
                };

                output.five_w1h = FiveW1H {
                    who: response.who,
                    what: response.what,
                    when: response.when,
                    where_: response.where_,
                    why: response.why,
                    how: response.how,
                };
                output.entities = response.entities;
                output.timeline = response.timeline;
                output.core_summary = response.core_summary;

                context.five_w1h = Some(output.five_w1h.clone());
                context.entities = output.entities.clone();
                context.timeline = output.timeline.clone();
                context.core_summary = output.core_summary.clone();

                let trace = trace.finish(format!(
                    "entities={} timeline={}",
                    output.entities.len(),
                    output.timeline.len()
                ));
                AgentOutput::ok(output, trace)
            }
            Err(e) => {
                warn!(url = article.url, error = %e, "Collector call failed");
                let trace = trace.finish_err("collector degraded to empty output", format!("{e:#}"));
                AgentOutput::failed(output, trace, format!("{e:#}"))
            }
        }
    }
}
