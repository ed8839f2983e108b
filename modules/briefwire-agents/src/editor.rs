use std::sync::Arc;

use ai_client::{with_agent, CallOptions, Gateway};
use briefwire_common::{EnrichedArticle, ExtractedEntity, FiveW1H};
use serde::Deserialize;
use tracing::warn;

use crate::context::AnalysisContext;
use crate::traits::{summarize, AgentOutput, TraceBuilder};

const NAME: &str = "editor";
const TOP_PICK_THRESHOLD: f64 = 8.0;

const SYSTEM_PROMPT: &str = r#"You are the chief editor. Given an article and
the layers of analysis assembled for it, produce the final editorial verdict
as JSON:

{
  "overall_score": 0.0,
  "summary": "2-3 sentence editorial summary",
  "tags": ["short", "topic", "tags"]
}

overall_score is 0-10: 9+ reshapes an industry, 7-8 matters to anyone in the
sector, 5-6 is routine news, below 5 is filler. Respond with JSON only."#;

#[derive(Debug, Clone, Deserialize, Default)]
struct EditorResponse {
    #[serde(default)]
    overall_score: f64,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// Merges every layer of the context into the final [`EnrichedArticle`].
pub struct Editor {
    gateway: Arc<Gateway>,
}

impl Editor {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    pub async fn process(&self, context: &AnalysisContext) -> AgentOutput<EnrichedArticle> {
        let mut trace = TraceBuilder::start(NAME, summarize(&context.article.title, 120));

        let mut user_prompt = format!(
            "Title: {}\nSource: {}\nCategory: {}\n\nCore summary: {}",
            context.article.title,
            context.article.source_name,
            context.article.category,
            context.core_summary,
        );
        if let Some(w) = &context.five_w1h {
            user_prompt.push_str(&format!("\nWhat: {}\nWhy: {}", w.what, w.why));
        }
        if !context.historical_context.is_empty() {
            user_prompt.push_str(&format!("\nHistorical context: {}", context.historical_context));
        }
        for (analyst, report) in &context.analyst_reports {
            user_prompt.push_str(&format!("\n\n[{analyst} report]\n{report}"));
        }

        let messages = Gateway::build_messages(SYSTEM_PROMPT, user_prompt, &[]);
        let response = match with_agent(NAME, self.gateway.chat_json(messages, CallOptions::default()))
            .await
        {
            Ok((parsed, usage)) => {
                trace.add_usage(&usage);
                match parsed.map(serde_json::from_value::<EditorResponse>) {
                    Some(Ok(response)) => response,
                    Some(Err(e)) => {
                        trace.warn(format!("schema mismatch: {e}"));
                        EditorResponse::default()
                    }
                    None => {
                        trace.warn("no recoverable JSON in response");
                        EditorResponse::default()
                    }
                }
            }
            Err(e) => {
                warn!(url = context.article.url, error = %e, "Editor call failed");
                let enriched = self.assemble(context, EditorResponse::default());
                let trace = trace.finish_err("assembled without editorial verdict", format!("{e:#}"));
                return AgentOutput::failed(enriched, trace, format!("{e:#}"));
            }
        };

        let enriched = self.assemble(context, response);
        let trace = trace.finish(format!("score={:.1}", enriched.overall_score));
        AgentOutput::ok(enriched, trace)
    }

    /// Deterministic assembly of the context layers; the model only
    /// contributes score, summary, and tags.
    fn assemble(&self, context: &AnalysisContext, response: EditorResponse) -> EnrichedArticle {
        let overall_score = if response.overall_score > 0.0 {
            response.overall_score.clamp(0.0, 10.0)
        } else {
            // No verdict: a bare midline score keeps the article flowing.
            5.0
        };

        let core_summary = if !response.summary.is_empty() {
            response.summary
        } else {
            context.core_summary.clone()
        };

        let entities = context
            .entities
            .iter()
            .map(|e| ExtractedEntity {
                name: e.name.clone(),
                entity_type: e.entity_type.clone(),
                ..Default::default()
            })
            .collect();

        EnrichedArticle {
            article: context.article.clone(),
            core_summary,
            five_w1h: context.five_w1h.clone().unwrap_or_else(FiveW1H::default),
            entities,
            historical_context: context.historical_context.clone(),
            related: context.related.clone(),
            analyst_reports: context.analyst_reports.clone(),
            overall_score,
            is_top_pick: overall_score >= TOP_PICK_THRESHOLD,
            tags: response.tags,
            traces: context.traces.clone(),
        }
    }
}
