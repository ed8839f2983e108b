use std::sync::Arc;

use ai_client::{with_agent, CallOptions, Gateway};
use briefwire_common::{Article, RelatedHit};
use briefwire_index::VectorIndex;
use tracing::warn;

use crate::context::AnalysisContext;
use crate::traits::{summarize, AgentOutput, TraceBuilder};

const NAME: &str = "librarian";
const TOP_K: usize = 5;

const SYSTEM_PROMPT: &str = r#"You are a news librarian doing retrieval-augmented
contextualization. Given a fresh article and excerpts of previously indexed
articles, write a short "historical context" paragraph: what prior coverage
exists, what changed since, and any pattern worth noting. If nothing relates,
say the story appears new. Respond with plain prose, no JSON."#;

#[derive(Debug, Clone, Default)]
pub struct LibrarianOutput {
    pub historical_context: String,
    /// Entities and inferred relations as loose JSON, consumed downstream by
    /// the knowledge-graph rendering surface.
    pub knowledge_graph: serde_json::Value,
    pub related: Vec<RelatedHit>,
}

/// Enriches context with prior coverage from the vector index. The
/// orchestrator indexes the article after analysis so later articles can
/// find it.
pub struct Librarian {
    gateway: Arc<Gateway>,
    index: Arc<dyn VectorIndex>,
}

impl Librarian {
    pub fn new(gateway: Arc<Gateway>, index: Arc<dyn VectorIndex>) -> Self {
        Self { gateway, index }
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
    ) -> AgentOutput<LibrarianOutput> {
        let mut trace = TraceBuilder::start(NAME, summarize(&article.title, 120));

        // Query: title plus the first five collected entity names.
        let entity_names: Vec<&str> = context
            .entities
            .iter()
            .take(5)
            .map(|e| e.name.as_str())
            .collect();
        let query = format!("{} {}", article.title, entity_names.join(" "));

        let related = match self.index.search(query.trim(), TOP_K).await {
            Ok(hits) => hits
                .into_iter()
                .map(|h| RelatedHit {
                    id: h.id,
                    score: h.score,
                    metadata: h.metadata,
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(url = article.url, error = %e, "Index search failed");
                trace.warn(format!("index search failed: {e}"));
                Vec::new()
            }
        };

        let mut output = LibrarianOutput {
            related: related.clone(),
            knowledge_graph: serde_json::json!({
                "entities": context.entities,
                "relations": [],
            }),
            ..Default::default()
        };

        if related.is_empty() {
            output.historical_context = String::new();
            context.related = related;
            let trace = trace.finish("no prior coverage indexed");
            return AgentOutput::ok(output, trace);
        }

        let related_lines: String = related
            .iter()
            .map(|hit| {
                let title = hit.metadata["title"].as_str().unwrap_or(&hit.id);
                format!("- ({:.2}) {title}", hit.score)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let user_prompt = format!(
            "New article: {}\n\nPreviously indexed coverage:\n{}",
            article.title, related_lines
        );
        let messages = Gateway::build_messages(SYSTEM_PROMPT, user_prompt, &[]);

        match with_agent(NAME, self.gateway.chat(messages, CallOptions::default())).await {
            Ok(completion) => {
                trace.add_usage(&completion.usage);
                output.historical_context = completion.text.trim().to_string();
                context.historical_context = output.historical_context.clone();
                context.related = related;
                let trace = trace.finish(format!("related={}", output.related.len()));
                AgentOutput::ok(output, trace)
            }
            Err(e) => {
                // Retrieval results still flow downstream without the prose.
                warn!(url = article.url, error = %e, "Librarian synthesis failed");
                context.related = related;
                let trace = trace.finish_err("kept raw retrieval hits", format!("{e:#}"));
                AgentOutput::failed(output, trace, format!("{e:#}"))
            }
        }
    }
}
