use std::sync::Arc;

use ai_client::{with_agent, CallOptions, Gateway};
use briefwire_common::{
    taxonomy, unit_fingerprint, unit_id, Article, EntityAnchor, ExtractedEntity,
    ExtractedRelation, FiveW1H, InformationUnit, SourceReference, StateDimension,
    TimeSensitivity, UnitType, ValueScores,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::normalize::{clean_article_text, truncate_for_prompt};
use crate::traits::{summarize, AgentOutput, TraceBuilder};

const NAME: &str = "extractor";
const MAX_PROMPT_BYTES: usize = 30_000;

const SYSTEM_PROMPT: &str = r#"You are an information-unit extractor. Decompose
the article into atomic, self-contained assertions. One unit = one claim a
reader could act on or file away; do not bundle unrelated facts.

Respond with JSON only:
{
  "units": [{
    "type": "FACT|OPINION|EVENT|DATA",
    "title": "one-line headline for the unit",
    "content": "the assertion, 1-3 sentences, self-contained",
    "summary": "one sentence",
    "event_time": "when the asserted thing happens/happened, as stated",
    "time_sensitivity": "urgent|normal|evergreen",
    "who": ["..."], "what": "...", "when": "...", "where": "...", "why": "...", "how": "...",
    "key_insights": ["..."],
    "scores": {
      "information_gain": 0-10,
      "actionability": 0-10,
      "scarcity": 0-10,
      "impact_magnitude": 0-10
    },
    "state_change_type": "TECH|CAPITAL|REGULATION|ORG|RISK|SENTIMENT|",
    "state_change_subtypes": ["..."],
    "entity_anchors": [{"l1_name": "...", "l1_role": "...", "l2_sector": "...", "l3_root": "...", "confidence": 0.0}]
  }],
  "entities": [{
    "name": "...", "entity_type": "COMPANY|PERSON|PRODUCT|ORG|CONCEPT|LOCATION|EVENT",
    "aliases": ["..."], "l3_root": "...", "l2_sector": "...",
    "role": "protagonist|supporting|mentioned", "sentiment": "positive|neutral|negative",
    "state_dimension": "TECH|CAPITAL|REGULATION|ORG|RISK|SENTIMENT|",
    "state_change": "what changed for this entity"
  }],
  "relations": [{
    "source": "...", "target": "...",
    "relation_type": "parent_of|subsidiary_of|competitor|partner|peer|supplier|customer|investor|ceo_of|founder_of|employee_of",
    "strength": 0.0, "confidence": 0.0
  }]
}

Scores: information_gain = how new is this; actionability = can a reader act
on it; scarcity = how few outlets have it; impact_magnitude = how much
changes if true."#;

#[derive(Debug, Clone, Deserialize, Default)]
struct ExtractorResponse {
    #[serde(default)]
    units: Vec<RawUnit>,
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
    #[serde(default)]
    relations: Vec<ExtractedRelation>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawUnit {
    #[serde(default, rename = "type")]
    unit_type: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    event_time: String,
    #[serde(default)]
    time_sensitivity: String,
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
    key_insights: Vec<String>,
    #[serde(default)]
    scores: RawScores,
    #[serde(default)]
    state_change_type: String,
    #[serde(default)]
    state_change_subtypes: Vec<String>,
    #[serde(default)]
    entity_anchors: Vec<EntityAnchor>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
struct RawScores {
    #[serde(default)]
    information_gain: f64,
    #[serde(default)]
    actionability: f64,
    #[serde(default)]
    scarcity: f64,
    #[serde(default)]
    impact_magnitude: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractorOutput {
    pub units: Vec<InformationUnit>,
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

/// Turns one article (plus optional analyst reports) into candidate
/// information units and raw entity/relation declarations.
pub struct Extractor {
    gateway: Arc<Gateway>,
    l3_roots: Vec<String>,
}

impl Extractor {
    pub fn new(gateway: Arc<Gateway>, l3_roots: Vec<String>) -> Self {
        let l3_roots = if l3_roots.is_empty() {
            taxonomy::default_roots()
        } else {
            l3_roots
        };
        Self { gateway, l3_roots }
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
        analyst_reports: &std::collections::HashMap<String, serde_json::Value>,
    ) -> AgentOutput<ExtractorOutput> {
        let mut trace = TraceBuilder::start(NAME, summarize(&article.title, 120));

        let cleaned = clean_article_text(article.best_content());
        let mut user_prompt = format!(
            "Title: {}\nSource: {}\nURL: {}\n\n{}",
            article.title,
            article.source_name,
            article.url,
            truncate_for_prompt(&cleaned, MAX_PROMPT_BYTES),
        );
        for (analyst, report) in analyst_reports {
            user_prompt.push_str(&format!("\n\n[{analyst} consultant notes]\n{report}"));
        }

        let messages = Gateway::build_messages(SYSTEM_PROMPT, user_prompt, &[]);

        match with_agent(NAME, self.gateway.chat_json(messages, CallOptions::default())).await {
            Ok((parsed, usage)) => {
                trace.add_usage(&usage);
                let response: ExtractorResponse = match parsed {
                    Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                        warn!(url = article.url, error = %e, "Extractor JSON did not match schema");
                        trace.warn(format!("schema mismatch: {e}"));
                        ExtractorResponse::default()
                    }),
                    None => {
                        trace.warn("no recoverable JSON in response");
                        ExtractorResponse::default()
                    }
                };

                let units: Vec<InformationUnit> = response
                    .units
                    .into_iter()
                    .filter_map(|raw| self.validate_unit(raw, article))
                    .collect();

                info!(url = article.url, units = units.len(), "extraction complete");

                let output = ExtractorOutput {
                    units,
                    entities: response.entities,
                    relations: response.relations,
                };
                let trace = trace.finish(format!(
                    "units={} entities={} relations={}",
                    output.units.len(),
                    output.entities.len(),
                    output.relations.len()
                ));
                AgentOutput::ok(output, trace)
            }
            Err(e) => {
                warn!(url = article.url, error = %e, "Extractor call failed");
                let trace = trace.finish_err("no units extracted", format!("{e:#}"));
                AgentOutput::failed(ExtractorOutput::default(), trace, format!("{e:#}"))
            }
        }
    }

    /// Repair and materialize one raw unit. Units without a usable title and
    /// content are dropped with a warning.
    fn validate_unit(&self, raw: RawUnit, article: &Article) -> Option<InformationUnit> {
        if raw.title.trim().is_empty() || raw.content.trim().is_empty() {
            warn!(url = article.url, "Dropping unit without title or content");
            return None;
        }

        let fingerprint = unit_fingerprint(&raw.title, &raw.content);
        let id = unit_id(&fingerprint);
        let now = Utc::now();

        let anchors = raw
            .entity_anchors
            .into_iter()
            .map(|mut anchor| {
                anchor.l3_root = taxonomy::resolve_l3_root(&anchor.l3_root, &self.l3_roots);
                anchor.confidence = anchor.confidence.clamp(0.0, 1.0);
                anchor
            })
            .collect();

        Some(InformationUnit {
            id,
            fingerprint,
            unit_type: UnitType::parse(&raw.unit_type),
            title: raw.title.trim().to_string(),
            content: raw.content.trim().to_string(),
            summary: if raw.summary.is_empty() {
                summarize(&raw.content, 200)
            } else {
                raw.summary
            },
            event_time: (!raw.event_time.trim().is_empty()).then(|| raw.event_time.trim().to_string()),
            report_time: article.published_at.unwrap_or(now),
            time_sensitivity: TimeSensitivity::parse(&raw.time_sensitivity),
            five_w1h: FiveW1H {
                who: raw.who,
                what: raw.what,
                when: raw.when,
                where_: raw.where_,
                why: raw.why,
                how: raw.how,
            },
            key_insights: raw.key_insights,
            scores: ValueScores {
                information_gain: raw.scores.information_gain,
                actionability: raw.scores.actionability,
                scarcity: raw.scores.scarcity,
                impact_magnitude: raw.scores.impact_magnitude,
            }
            .normalized(),
            state_change_type: StateDimension::parse(&raw.state_change_type),
            state_change_subtypes: raw.state_change_subtypes,
            entity_anchors: anchors,
            sources: vec![source_reference(article)],
            primary_source: article.url.clone(),
            merged_count: 1,
            is_sent: false,
            entity_processed: false,
            created_at: now,
            updated_at: now,
        })
    }
}

/// The article as a unit source.
pub fn source_reference(article: &Article) -> SourceReference {
    SourceReference {
        url: article.url.clone(),
        title: article.title.clone(),
        source_name: article.source_name.clone(),
        published_at: article.published_at,
        excerpt: summarize(&article.summary, 280),
        credibility_tier: 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gateway_with_json, sample_article};

    fn raw_response(units: serde_json::Value) -> String {
        serde_json::json!({ "units": units, "entities": [], "relations": [] }).to_string()
    }

    #[tokio::test]
    async fn scores_are_rescaled_and_clamped() {
        let response = raw_response(serde_json::json!([{
            "type": "FACT",
            "title": "Scores get repaired",
            "content": "A unit whose raw scores are out of range.",
            "scores": {
                "information_gain": 0.85,
                "actionability": 7,
                "scarcity": 11.0,
                "impact_magnitude": -2
            }
        }]));
        let gateway = gateway_with_json(&response);
        let extractor = Extractor::new(gateway, Vec::new());

        let output = extractor
            .process(&sample_article("https://example.com/a"), &Default::default())
            .await;
        assert!(output.success);
        let unit = &output.data.units[0];
        assert_eq!(unit.scores.information_gain, 8.5);
        assert_eq!(unit.scores.actionability, 7.0);
        assert_eq!(unit.scores.scarcity, 10.0);
        assert_eq!(unit.scores.impact_magnitude, 1.0);
    }

    #[tokio::test]
    async fn unknown_l3_root_maps_to_other() {
        let response = raw_response(serde_json::json!([{
            "type": "FACT",
            "title": "Anchored unit",
            "content": "Some content.",
            "entity_anchors": [
                {"l1_name": "Acme", "l3_root": "Quantum Basket Weaving", "confidence": 1.5},
                {"l1_name": "Birch", "l3_root": "semiconductors", "confidence": 0.9}
            ]
        }]));
        let gateway = gateway_with_json(&response);
        let extractor = Extractor::new(gateway, Vec::new());

        let output = extractor
            .process(&sample_article("https://example.com/a"), &Default::default())
            .await;
        let anchors = &output.data.units[0].entity_anchors;
        assert_eq!(anchors[0].l3_root, "Other");
        assert_eq!(anchors[0].confidence, 1.0);
        assert_eq!(anchors[1].l3_root, "Semiconductors");
    }

    #[tokio::test]
    async fn unknown_state_change_maps_to_none() {
        let response = raw_response(serde_json::json!([{
            "type": "EVENT",
            "title": "State change validation",
            "content": "Some content.",
            "state_change_type": "WEATHER"
        }]));
        let gateway = gateway_with_json(&response);
        let extractor = Extractor::new(gateway, Vec::new());

        let output = extractor
            .process(&sample_article("https://example.com/a"), &Default::default())
            .await;
        assert_eq!(output.data.units[0].state_change_type, None);
    }

    #[tokio::test]
    async fn unit_identity_derives_from_content() {
        let response = raw_response(serde_json::json!([{
            "type": "FACT",
            "title": "Stable Title",
            "content": "Stable content."
        }]));
        let gateway = gateway_with_json(&response);
        let extractor = Extractor::new(gateway, Vec::new());

        let output = extractor
            .process(&sample_article("https://example.com/a"), &Default::default())
            .await;
        let unit = &output.data.units[0];
        assert_eq!(unit.fingerprint, unit_fingerprint("Stable Title", "Stable content."));
        assert_eq!(unit.id, unit_id(&unit.fingerprint));
        assert_eq!(unit.merged_count, 1);
        assert_eq!(unit.sources.len(), 1);
        assert_eq!(unit.sources[0].url, "https://example.com/a");
        assert!(!unit.entity_processed);
    }

    #[tokio::test]
    async fn titleless_units_are_dropped() {
        let response = raw_response(serde_json::json!([
            {"type": "FACT", "title": "", "content": "orphan content"},
            {"type": "FACT", "title": "kept", "content": "kept content"}
        ]));
        let gateway = gateway_with_json(&response);
        let extractor = Extractor::new(gateway, Vec::new());

        let output = extractor
            .process(&sample_article("https://example.com/a"), &Default::default())
            .await;
        assert_eq!(output.data.units.len(), 1);
        assert_eq!(output.data.units[0].title, "kept");
    }

    #[tokio::test]
    async fn unparseable_response_degrades_to_empty_success() {
        let gateway = gateway_with_json("this is not json at all");
        let extractor = Extractor::new(gateway, Vec::new());

        let output = extractor
            .process(&sample_article("https://example.com/a"), &Default::default())
            .await;
        assert!(output.success);
        assert!(output.data.units.is_empty());
        assert!(output.trace.warning.is_some());
    }
}
