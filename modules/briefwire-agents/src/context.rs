use std::collections::HashMap;

use briefwire_common::{AgentTrace, AnalysisMode, Article, FiveW1H, RelatedHit};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An entity as surfaced by the Collector.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct CollectedEntity {
    pub name: String,
    #[serde(default, rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

/// One step of the Collector's event timeline.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct TimelineEvent {
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub impact: String,
}

/// Mutable state threaded through one article's analysis. Exists only for
/// the duration of that analysis; never persisted.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub article: Article,
    pub cleaned_content: String,
    pub five_w1h: Option<FiveW1H>,
    pub entities: Vec<CollectedEntity>,
    pub timeline: Vec<TimelineEvent>,
    pub core_summary: String,
    pub historical_context: String,
    pub related: Vec<RelatedHit>,
    pub analyst_reports: HashMap<String, serde_json::Value>,
    pub mode: AnalysisMode,
    pub traces: Vec<AgentTrace>,
}

impl AnalysisContext {
    pub fn new(article: Article, mode: AnalysisMode) -> Self {
        Self {
            article,
            cleaned_content: String::new(),
            five_w1h: None,
            entities: Vec::new(),
            timeline: Vec::new(),
            core_summary: String::new(),
            historical_context: String::new(),
            related: Vec::new(),
            analyst_reports: HashMap::new(),
            mode,
            traces: Vec::new(),
        }
    }

    pub fn push_trace(&mut self, trace: AgentTrace) {
        self.traces.push(trace);
    }

    /// The content agents should analyze: cleaned if the Collector ran,
    /// otherwise the article's best available text.
    pub fn analysis_text(&self) -> &str {
        if self.cleaned_content.is_empty() {
            self.article.best_content()
        } else {
            &self.cleaned_content
        }
    }
}
