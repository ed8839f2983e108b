use briefwire_common::{AgentTrace, TokenUsage};
use chrono::{DateTime, Utc};

/// Result of one agent run. `success = false` never aborts the pipeline;
/// the orchestrator degrades the affected slot instead.
#[derive(Debug, Clone)]
pub struct AgentOutput<T> {
    pub success: bool,
    pub data: T,
    pub trace: AgentTrace,
    pub error: Option<String>,
}

impl<T> AgentOutput<T> {
    pub fn ok(data: T, trace: AgentTrace) -> Self {
        Self {
            success: true,
            data,
            trace,
            error: None,
        }
    }

    pub fn failed(data: T, trace: AgentTrace, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            data,
            trace,
            error: Some(error),
        }
    }
}

/// Builds an [`AgentTrace`] around one agent run.
pub struct TraceBuilder {
    agent: String,
    started_at: DateTime<Utc>,
    started: std::time::Instant,
    usage: TokenUsage,
    input_summary: String,
    warning: Option<String>,
}

impl TraceBuilder {
    pub fn start(agent: &str, input_summary: impl Into<String>) -> Self {
        Self {
            agent: agent.to_string(),
            started_at: Utc::now(),
            started: std::time::Instant::now(),
            usage: TokenUsage::default(),
            input_summary: input_summary.into(),
            warning: None,
        }
    }

    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.usage.add(usage);
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warning = Some(warning.into());
    }

    pub fn finish(self, output_summary: impl Into<String>) -> AgentTrace {
        self.build(output_summary, None)
    }

    pub fn finish_err(self, output_summary: impl Into<String>, error: impl Into<String>) -> AgentTrace {
        self.build(output_summary, Some(error.into()))
    }

    fn build(self, output_summary: impl Into<String>, error: Option<String>) -> AgentTrace {
        AgentTrace {
            agent: self.agent,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as i64,
            token_usage: self.usage,
            input_summary: self.input_summary,
            output_summary: output_summary.into(),
            error,
            warning: self.warning,
        }
    }
}

/// Shorten a string for trace summaries.
pub fn summarize(text: &str, cap: usize) -> String {
    let mut out: String = text.chars().take(cap).collect();
    if text.chars().count() > cap {
        out.push('…');
    }
    out
}
