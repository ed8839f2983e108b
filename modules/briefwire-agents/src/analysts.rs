use std::sync::Arc;

use ai_client::{with_agent, CallOptions, Gateway};
use tracing::warn;

use crate::context::AnalysisContext;
use crate::normalize::truncate_for_prompt;
use crate::traits::{summarize, AgentOutput, TraceBuilder};

const MAX_PROMPT_BYTES: usize = 20_000;

/// The three deep-mode analysts. Each emits its own fixed JSON schema; the
/// orchestrator keys reports by `name()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalystKind {
    Skeptic,
    Economist,
    Detective,
}

impl AnalystKind {
    pub fn all() -> [AnalystKind; 3] {
        [Self::Skeptic, Self::Economist, Self::Detective]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Skeptic => "skeptic",
            Self::Economist => "economist",
            Self::Detective => "detective",
        }
    }

    fn system_prompt(&self) -> &'static str {
        match self {
            Self::Skeptic => {
                r#"You are a skeptical fact-checker reviewing a news article.

Respond with JSON only:
{
  "claims": [{"claim": "...", "support": "stated evidence", "weakness": "what's missing or shaky"}],
  "counter_evidence": ["known facts that cut against the story"],
  "unanswered_questions": ["..."],
  "credibility": 0.0
}
credibility is your 0-1 confidence that the core story holds up."#
            }
            Self::Economist => {
                r#"You are a market economist reviewing a news article.

Respond with JSON only:
{
  "market_impact": "who gains, who loses, over what horizon",
  "cost_structure": "what this does to costs/prices in the sector",
  "beneficiaries": ["..."],
  "losers": ["..."],
  "second_order_effects": ["..."],
  "confidence": 0.0
}"#
            }
            Self::Detective => {
                r#"You are an investigative detective reviewing a news article.

Respond with JSON only:
{
  "hidden_connections": [{"between": ["a", "b"], "hypothesis": "...", "evidence": "..."}],
  "timing_observations": "why now, what else coincides",
  "who_benefits": ["..."],
  "follow_the_money": "...",
  "confidence": 0.0
}"#
            }
        }
    }
}

/// Runs one analyst over the article plus shared context. Failure yields an
/// empty report in the analyst's slot, never a pipeline failure.
pub struct Analyst {
    kind: AnalystKind,
    gateway: Arc<Gateway>,
}

impl Analyst {
    pub fn new(kind: AnalystKind, gateway: Arc<Gateway>) -> Self {
        Self { kind, gateway }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn system_prompt(&self) -> &'static str {
        self.kind.system_prompt()
    }

    pub async fn process(&self, context: &AnalysisContext) -> AgentOutput<serde_json::Value> {
        let name = self.kind.name();
        let mut trace = TraceBuilder::start(name, summarize(&context.article.title, 120));

        let mut user_prompt = format!(
            "Title: {}\n\n{}",
            context.article.title,
            truncate_for_prompt(context.analysis_text(), MAX_PROMPT_BYTES),
        );
        if !context.core_summary.is_empty() {
            user_prompt.push_str(&format!("\n\nCollector summary: {}", context.core_summary));
        }
        if !context.historical_context.is_empty() {
            user_prompt.push_str(&format!(
                "\n\nHistorical context: {}",
                context.historical_context
            ));
        }

        let messages = Gateway::build_messages(self.kind.system_prompt(), user_prompt, &[]);

        match with_agent(name, self.gateway.chat_json(messages, CallOptions::default())).await {
            Ok((Some(report), usage)) => {
                trace.add_usage(&usage);
                let trace = trace.finish("report produced");
                AgentOutput::ok(report, trace)
            }
            Ok((None, usage)) => {
                trace.add_usage(&usage);
                trace.warn("no recoverable JSON in response");
                let trace = trace.finish("empty report");
                AgentOutput::ok(serde_json::json!({}), trace)
            }
            Err(e) => {
                warn!(analyst = name, url = context.article.url, error = %e, "Analyst failed");
                let trace = trace.finish_err("empty report", format!("{e:#}"));
                AgentOutput::failed(serde_json::json!({}), trace, format!("{e:#}"))
            }
        }
    }
}
