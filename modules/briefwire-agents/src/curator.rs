use std::sync::Arc;

use ai_client::{with_agent, CallOptions, Gateway};
use briefwire_common::InformationUnit;
use serde::Deserialize;
use tracing::{info, warn};

use crate::traits::{AgentOutput, TraceBuilder};

const NAME: &str = "curator";
const TOP_PICK_THRESHOLD: f64 = 8.0;
const TOP_PICK_MAX: usize = 10;
const QUICK_READ_THRESHOLD: f64 = 5.0;
const QUICK_READ_MAX: usize = 20;
/// Two scores within this distance count as a tie for diversity purposes.
const SCORE_TIE_EPSILON: f64 = 1e-9;

const SUMMARY_PROMPT: &str = r#"You are the digest curator. Write one tight
paragraph (3-5 sentences) summarizing today's top picks for a busy reader:
what mattered, why, and any thread connecting them. Plain prose, no lists,
no JSON."#;

const HISTORY_PROMPT: &str = r#"You are the digest curator. You are given
numbered candidate items and a list of recently sent items. Identify
candidates that are near-duplicates of something already sent.

Respond with JSON only: {"exclude_indices": [0, 2, ...]}
Indices refer to the candidate numbering. An empty list is a valid answer."#;

#[derive(Debug, Clone, Deserialize, Default)]
struct HistoryResponse {
    #[serde(default)]
    exclude_indices: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct CuratorSettings {
    pub top_pick_count: usize,
    pub min_score: f64,
    pub max_quick_reads: usize,
}

impl Default for CuratorSettings {
    fn default() -> Self {
        Self {
            top_pick_count: 5,
            min_score: QUICK_READ_THRESHOLD,
            max_quick_reads: QUICK_READ_MAX,
        }
    }
}

/// The curated digest window before rendering.
#[derive(Debug, Clone, Default)]
pub struct Curation {
    pub top_picks: Vec<InformationUnit>,
    pub quick_reads: Vec<InformationUnit>,
    pub excluded: Vec<InformationUnit>,
    pub daily_summary: String,
}

/// Selects and ranks unsent units for one digest window.
pub struct Curator {
    gateway: Arc<Gateway>,
    settings: CuratorSettings,
}

impl Curator {
    pub fn new(gateway: Arc<Gateway>, settings: CuratorSettings) -> Self {
        Self { gateway, settings }
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn system_prompt(&self) -> &'static str {
        SUMMARY_PROMPT
    }

    /// `recent_sent` is (title, summary) of recently delivered units, used
    /// to avoid re-sending near-duplicates.
    pub async fn curate(
        &self,
        units: Vec<InformationUnit>,
        recent_sent: &[(String, String)],
    ) -> AgentOutput<Curation> {
        let mut trace = TraceBuilder::start(NAME, format!("candidates={}", units.len()));

        let mut top_picks = select_top_picks(&units, self.settings.top_pick_count);

        // History avoidance: the model may veto near-duplicates; a failure
        // keeps the deterministic selection.
        if !recent_sent.is_empty() && !top_picks.is_empty() {
            match self.filter_against_history(&top_picks, recent_sent).await {
                Ok((filtered, usage)) => {
                    trace.add_usage(&usage);
                    if !filtered.is_empty() {
                        top_picks = filtered;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "History filter failed, keeping score-ranked picks");
                    trace.warn(format!("history filter failed: {e}"));
                }
            }
        }

        let picked_ids: Vec<&str> = top_picks.iter().map(|u| u.id.as_str()).collect();
        let mut quick_reads = Vec::new();
        let mut excluded = Vec::new();
        for unit in units {
            if picked_ids.contains(&unit.id.as_str()) {
                continue;
            }
            if unit.value_score() >= self.settings.min_score
                && quick_reads.len() < self.settings.max_quick_reads
            {
                quick_reads.push(unit);
            } else {
                excluded.push(unit);
            }
        }

        let daily_summary = match self.summarize_picks(&top_picks).await {
            Ok((summary, usage)) => {
                trace.add_usage(&usage);
                summary
            }
            Err(e) => {
                warn!(error = %e, "Daily summary failed, using fallback");
                trace.warn(format!("summary failed: {e}"));
                fallback_summary(&top_picks)
            }
        };

        info!(
            top_picks = top_picks.len(),
            quick_reads = quick_reads.len(),
            excluded = excluded.len(),
            "curation complete"
        );

        let curation = Curation {
            top_picks,
            quick_reads,
            excluded,
            daily_summary,
        };
        let trace = trace.finish(format!(
            "picks={} quick={}",
            curation.top_picks.len(),
            curation.quick_reads.len()
        ));
        AgentOutput::ok(curation, trace)
    }

    async fn filter_against_history(
        &self,
        picks: &[InformationUnit],
        recent_sent: &[(String, String)],
    ) -> anyhow::Result<(Vec<InformationUnit>, briefwire_common::TokenUsage)> {
        let candidates: String = picks
            .iter()
            .enumerate()
            .map(|(i, u)| format!("{i}. {} :: {}", u.title, u.summary))
            .collect::<Vec<_>>()
            .join("\n");
        let history: String = recent_sent
            .iter()
            .map(|(title, summary)| format!("- {title} :: {summary}"))
            .collect::<Vec<_>>()
            .join("\n");
        let user_prompt = format!("Candidates:\n{candidates}\n\nRecently sent:\n{history}");

        let messages = Gateway::build_messages(HISTORY_PROMPT, user_prompt, &[]);
        let (parsed, usage) = with_agent(
            NAME,
            self.gateway.chat_json(messages, CallOptions::default()),
        )
        .await?;

        let response: HistoryResponse = parsed
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();

        let filtered: Vec<InformationUnit> = picks
            .iter()
            .enumerate()
            .filter(|(i, _)| !response.exclude_indices.contains(i))
            .map(|(_, u)| u.clone())
            .collect();
        Ok((filtered, usage))
    }

    async fn summarize_picks(
        &self,
        picks: &[InformationUnit],
    ) -> anyhow::Result<(String, briefwire_common::TokenUsage)> {
        if picks.is_empty() {
            return Ok((String::new(), briefwire_common::TokenUsage::default()));
        }
        let lines: String = picks
            .iter()
            .map(|u| format!("- {} :: {}", u.title, u.summary))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = Gateway::build_messages(SUMMARY_PROMPT, lines, &[]);
        let completion = with_agent(
            NAME,
            self.gateway.chat(messages, CallOptions::default()),
        )
        .await?;
        Ok((completion.text.trim().to_string(), completion.usage))
    }
}

/// Greedy score-ranked selection with an L3 diversity tie-break: when two
/// candidates tie on score, the one whose root category is not yet
/// represented wins.
fn select_top_picks(units: &[InformationUnit], top_pick_count: usize) -> Vec<InformationUnit> {
    let mut qualified: Vec<&InformationUnit> = units
        .iter()
        .filter(|u| u.value_score() >= TOP_PICK_THRESHOLD)
        .collect();

    // Too few above the bar: fall back to plain top-K by score.
    let (mut pool, cap) = if qualified.len() < 3 {
        let mut all: Vec<&InformationUnit> = units.iter().collect();
        all.sort_by(|a, b| {
            b.value_score()
                .partial_cmp(&a.value_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(top_pick_count.max(1));
        (all, top_pick_count.max(1))
    } else {
        qualified.sort_by(|a, b| {
            b.value_score()
                .partial_cmp(&a.value_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        (qualified, TOP_PICK_MAX)
    };

    let mut picks: Vec<InformationUnit> = Vec::new();
    let mut represented_roots: Vec<String> = Vec::new();

    while picks.len() < cap && !pool.is_empty() {
        let best_score = pool[0].value_score();
        // Among candidates tied with the leader, prefer an unrepresented root.
        let choice_idx = pool
            .iter()
            .position(|u| {
                (best_score - u.value_score()).abs() <= SCORE_TIE_EPSILON
                    && !represented_roots.contains(&root_of(u))
            })
            .unwrap_or(0);

        let chosen = pool.remove(choice_idx);
        let root = root_of(chosen);
        if !root.is_empty() && !represented_roots.contains(&root) {
            represented_roots.push(root);
        }
        picks.push(chosen.clone());
    }

    picks
}

fn root_of(unit: &InformationUnit) -> String {
    unit.entity_anchors
        .first()
        .map(|a| a.l3_root.clone())
        .unwrap_or_default()
}

fn fallback_summary(picks: &[InformationUnit]) -> String {
    if picks.is_empty() {
        return "No stories cleared the bar for this digest window.".to_string();
    }
    let titles: Vec<&str> = picks.iter().take(3).map(|u| u.title.as_str()).collect();
    format!("Today's top stories: {}.", titles.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{failing_gateway, gateway_with_responses};
    use briefwire_common::{
        unit_fingerprint, unit_id, EntityAnchor, FiveW1H, TimeSensitivity, UnitType, ValueScores,
    };
    use chrono::Utc;

    fn unit(title: &str, score: f64, l3_root: &str) -> InformationUnit {
        // A uniform ValueScores vector yields value_score == score.
        let fingerprint = unit_fingerprint(title, title);
        InformationUnit {
            id: unit_id(&fingerprint),
            fingerprint,
            unit_type: UnitType::Fact,
            title: title.to_string(),
            content: title.to_string(),
            summary: format!("{title} summary"),
            event_time: None,
            report_time: Utc::now(),
            time_sensitivity: TimeSensitivity::Normal,
            five_w1h: FiveW1H::default(),
            key_insights: Vec::new(),
            scores: ValueScores {
                information_gain: score,
                actionability: score,
                scarcity: score,
                impact_magnitude: score,
            },
            state_change_type: None,
            state_change_subtypes: Vec::new(),
            entity_anchors: vec![EntityAnchor {
                l1_name: "x".to_string(),
                l3_root: l3_root.to_string(),
                ..Default::default()
            }],
            sources: Vec::new(),
            primary_source: String::new(),
            merged_count: 1,
            is_sent: false,
            entity_processed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn threshold_selection_and_bucketing() {
        let units = vec![
            unit("high-1", 9.0, "AI"),
            unit("high-2", 8.5, "Finance"),
            unit("high-3", 8.2, "Energy"),
            unit("mid", 6.0, "AI"),
            unit("low", 3.0, "AI"),
        ];
        let picks = select_top_picks(&units, 5);
        assert_eq!(picks.len(), 3);
        assert!(picks.iter().all(|u| u.value_score() >= 8.0));
    }

    #[test]
    fn too_few_qualified_falls_back_to_top_k() {
        let units = vec![
            unit("a", 9.0, "AI"),
            unit("b", 6.0, "Finance"),
            unit("c", 5.0, "Energy"),
            unit("d", 4.0, "Media"),
        ];
        let picks = select_top_picks(&units, 3);
        assert_eq!(picks.len(), 3);
        assert_eq!(picks[0].title, "a");
        assert_eq!(picks[1].title, "b");
        assert_eq!(picks[2].title, "c");
    }

    #[test]
    fn diversity_tie_break_prefers_new_root() {
        let units = vec![
            unit("ai-1", 9.0, "AI"),
            unit("ai-2", 8.5, "AI"),
            unit("fin", 8.5, "Finance"),
            unit("ai-3", 8.4, "AI"),
        ];
        let picks = select_top_picks(&units, 5);
        // ai-1 leads; between the tied 8.5s, Finance is unrepresented.
        assert_eq!(picks[0].title, "ai-1");
        assert_eq!(picks[1].title, "fin");
        assert_eq!(picks[2].title, "ai-2");
    }

    #[tokio::test]
    async fn curate_buckets_quick_reads_and_excluded() {
        // First call: history filter (none needed since no history);
        // the only call is the daily summary.
        let gateway = gateway_with_responses(vec!["A fine daily summary.".to_string()]);
        let curator = Curator::new(gateway, CuratorSettings::default());

        let units = vec![
            unit("pick-1", 9.0, "AI"),
            unit("pick-2", 8.5, "Finance"),
            unit("pick-3", 8.1, "Energy"),
            unit("quick", 6.5, "Media"),
            unit("excluded", 2.0, "Macro"),
        ];

        let output = curator.curate(units, &[]).await;
        assert!(output.success);
        let curation = output.data;
        assert_eq!(curation.top_picks.len(), 3);
        assert_eq!(curation.quick_reads.len(), 1);
        assert_eq!(curation.quick_reads[0].title, "quick");
        assert_eq!(curation.excluded.len(), 1);
        assert_eq!(curation.daily_summary, "A fine daily summary.");
    }

    #[tokio::test]
    async fn history_filter_drops_flagged_candidates() {
        let gateway = gateway_with_responses(vec![
            r#"{"exclude_indices": [0]}"#.to_string(),
            "Summary.".to_string(),
        ]);
        let curator = Curator::new(gateway, CuratorSettings::default());

        let units = vec![
            unit("already-sent", 9.0, "AI"),
            unit("fresh-1", 8.6, "Finance"),
            unit("fresh-2", 8.3, "Energy"),
        ];
        let history = vec![("already-sent".to_string(), "same story".to_string())];

        let output = curator.curate(units, &history).await;
        let titles: Vec<&str> = output.data.top_picks.iter().map(|u| u.title.as_str()).collect();
        assert!(!titles.contains(&"already-sent"));
        assert!(titles.contains(&"fresh-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn llm_failure_falls_back_to_deterministic_output() {
        let curator = Curator::new(failing_gateway(), CuratorSettings::default());

        let units = vec![
            unit("pick-1", 9.0, "AI"),
            unit("pick-2", 8.5, "Finance"),
            unit("pick-3", 8.1, "Energy"),
        ];
        let history = vec![("old".to_string(), "old summary".to_string())];

        let output = curator.curate(units, &history).await;
        assert!(output.success);
        assert_eq!(output.data.top_picks.len(), 3);
        assert!(output.data.daily_summary.starts_with("Today's top stories:"));
        assert!(output.trace.warning.is_some());
    }
}
