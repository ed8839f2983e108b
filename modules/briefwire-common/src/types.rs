use std::collections::HashMap;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// --- Articles ---

/// A single article pulled from a feed. Identity is the canonical URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub url: String,
    pub title: String,
    /// Content as provided by the feed entry.
    pub content: String,
    /// Full-page text recovered by the extraction pass, when it ran.
    pub extracted_content: Option<String>,
    pub summary: String,
    pub source_name: String,
    pub category: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Article {
    /// The richest text available for analysis: extracted page content when
    /// present, feed content otherwise.
    pub fn best_content(&self) -> &str {
        match &self.extracted_content {
            Some(c) if !c.is_empty() => c,
            _ => &self.content,
        }
    }
}

// --- Information units ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnitType {
    Fact,
    Opinion,
    Event,
    Data,
}

impl UnitType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "OPINION" => Self::Opinion,
            "EVENT" => Self::Event,
            "DATA" => Self::Data,
            _ => Self::Fact,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "FACT",
            Self::Opinion => "OPINION",
            Self::Event => "EVENT",
            Self::Data => "DATA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeSensitivity {
    Urgent,
    Normal,
    Evergreen,
}

impl TimeSensitivity {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "urgent" => Self::Urgent,
            "evergreen" => Self::Evergreen,
            _ => Self::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Normal => "normal",
            Self::Evergreen => "evergreen",
        }
    }
}

/// The six state-change dimensions a unit can assert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateDimension {
    Tech,
    Capital,
    Regulation,
    Org,
    Risk,
    Sentiment,
}

impl StateDimension {
    /// Parse a raw label. Unknown labels yield `None`, which serializes as
    /// an empty string in storage.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "TECH" => Some(Self::Tech),
            "CAPITAL" => Some(Self::Capital),
            "REGULATION" => Some(Self::Regulation),
            "ORG" => Some(Self::Org),
            "RISK" => Some(Self::Risk),
            "SENTIMENT" => Some(Self::Sentiment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tech => "TECH",
            Self::Capital => "CAPITAL",
            Self::Regulation => "REGULATION",
            Self::Org => "ORG",
            Self::Risk => "RISK",
            Self::Sentiment => "SENTIMENT",
        }
    }

    pub fn to_storage(value: Option<Self>) -> String {
        value.map(|v| v.as_str().to_string()).unwrap_or_default()
    }

    pub fn from_storage(s: &str) -> Option<Self> {
        Self::parse(s)
    }
}

/// The four value dimensions scored per unit, each in [1.0, 10.0].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct ValueScores {
    pub information_gain: f64,
    pub actionability: f64,
    pub scarcity: f64,
    pub impact_magnitude: f64,
}

impl ValueScores {
    /// Repair raw model output: values in (0, 1] are treated as a 0-1 scale
    /// and rescaled by 10; everything is then clamped to [1.0, 10.0].
    pub fn normalized(self) -> Self {
        Self {
            information_gain: normalize_score(self.information_gain),
            actionability: normalize_score(self.actionability),
            scarcity: normalize_score(self.scarcity),
            impact_magnitude: normalize_score(self.impact_magnitude),
        }
    }

    /// Weighted aggregate. Derived on demand, never stored.
    pub fn value_score(&self) -> f64 {
        0.30 * self.information_gain
            + 0.25 * self.actionability
            + 0.20 * self.scarcity
            + 0.25 * self.impact_magnitude
    }
}

fn normalize_score(raw: f64) -> f64 {
    let scaled = if raw > 0.0 && raw <= 1.0 { raw * 10.0 } else { raw };
    scaled.clamp(1.0, 10.0)
}

/// Three-tier anchor placing a unit in the entity hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct EntityAnchor {
    /// Leaf entity name, e.g. "OpenAI".
    pub l1_name: String,
    /// The entity's role in this unit, e.g. "acquirer".
    #[serde(default)]
    pub l1_role: String,
    /// Sector, e.g. "Foundation Models".
    #[serde(default)]
    pub l2_sector: String,
    /// Root category, resolved against the preset root set.
    #[serde(default)]
    pub l3_root: String,
    #[serde(default)]
    pub confidence: f64,
}

/// A source that reported a unit. Equality and hashing are URL-only.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SourceReference {
    pub url: String,
    pub title: String,
    pub source_name: String,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub excerpt: String,
    /// 1 = wire service ... 5 = unknown blog.
    #[serde(default = "default_credibility")]
    pub credibility_tier: u8,
}

fn default_credibility() -> u8 {
    3
}

impl PartialEq for SourceReference {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for SourceReference {}

impl std::hash::Hash for SourceReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

/// The Who/What/When/Where/Why/How distilled from an article.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct FiveW1H {
    #[serde(default)]
    pub who: Vec<String>,
    #[serde(default)]
    pub what: String,
    #[serde(default)]
    pub when: String,
    #[serde(default, rename = "where")]
    pub where_: String,
    #[serde(default)]
    pub why: String,
    #[serde(default)]
    pub how: String,
}

/// An atomic assertion extracted from one or more articles. Identity is the
/// content fingerprint; merging across sources preserves the first identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InformationUnit {
    /// `"iu_"` + first 16 hex chars of the fingerprint.
    pub id: String,
    /// md5 of normalized title + normalized content.
    pub fingerprint: String,
    pub unit_type: UnitType,
    pub title: String,
    pub content: String,
    pub summary: String,
    /// Event time as reported; may be relative prose ("last Tuesday").
    pub event_time: Option<String>,
    pub report_time: DateTime<Utc>,
    pub time_sensitivity: TimeSensitivity,
    pub five_w1h: FiveW1H,
    pub key_insights: Vec<String>,
    pub scores: ValueScores,
    pub state_change_type: Option<StateDimension>,
    pub state_change_subtypes: Vec<String>,
    pub entity_anchors: Vec<EntityAnchor>,
    pub sources: Vec<SourceReference>,
    pub primary_source: String,
    pub merged_count: u32,
    pub is_sent: bool,
    pub entity_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InformationUnit {
    /// Weighted aggregate score; see [`ValueScores::value_score`].
    pub fn value_score(&self) -> f64 {
        self.scores.value_score()
    }

    /// Append sources, deduplicating by URL, and refresh `merged_count`.
    pub fn absorb_sources(&mut self, incoming: &[SourceReference]) {
        for src in incoming {
            if !self.sources.iter().any(|s| s.url == src.url) {
                self.sources.push(src.clone());
            }
        }
        self.merged_count = self.sources.len() as u32;
    }

    /// Text used when indexing this unit for semantic lookup.
    pub fn index_text(&self) -> String {
        let insights = self
            .key_insights
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} {} {}", self.title, self.summary, insights)
            .trim()
            .to_string()
    }
}

/// Normalize text for fingerprinting: trim, lowercase, collapse whitespace.
pub fn normalize_for_fingerprint(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable content fingerprint over normalized title + content.
pub fn unit_fingerprint(title: &str, content: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(normalize_for_fingerprint(title).as_bytes());
    hasher.update(normalize_for_fingerprint(content).as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the unit id from its fingerprint.
pub fn unit_id(fingerprint: &str) -> String {
    format!("iu_{}", &fingerprint[..16.min(fingerprint.len())])
}

// --- Entities ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Company,
    Person,
    Product,
    Org,
    Concept,
    Location,
    Event,
}

impl EntityType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "PERSON" => Self::Person,
            "PRODUCT" => Self::Product,
            "ORG" | "ORGANIZATION" => Self::Org,
            "CONCEPT" => Self::Concept,
            "LOCATION" => Self::Location,
            "EVENT" => Self::Event,
            _ => Self::Company,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Company => "COMPANY",
            Self::Person => "PERSON",
            Self::Product => "PRODUCT",
            Self::Org => "ORG",
            Self::Concept => "CONCEPT",
            Self::Location => "LOCATION",
            Self::Event => "EVENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MentionRole {
    Protagonist,
    Supporting,
    Mentioned,
}

impl MentionRole {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "supporting" => Self::Supporting,
            "mentioned" => Self::Mentioned,
            _ => Self::Protagonist,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Protagonist => "protagonist",
            Self::Supporting => "supporting",
            Self::Mentioned => "mentioned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "positive" => Self::Positive,
            "negative" => Self::Negative,
            _ => Self::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    ParentOf,
    SubsidiaryOf,
    Competitor,
    Partner,
    Peer,
    Supplier,
    Customer,
    Investor,
    CeoOf,
    FounderOf,
    EmployeeOf,
}

impl RelationType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "parent_of" => Some(Self::ParentOf),
            "subsidiary_of" => Some(Self::SubsidiaryOf),
            "competitor" => Some(Self::Competitor),
            "partner" => Some(Self::Partner),
            "peer" => Some(Self::Peer),
            "supplier" => Some(Self::Supplier),
            "customer" => Some(Self::Customer),
            "investor" => Some(Self::Investor),
            "ceo_of" => Some(Self::CeoOf),
            "founder_of" => Some(Self::FounderOf),
            "employee_of" => Some(Self::EmployeeOf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParentOf => "parent_of",
            Self::SubsidiaryOf => "subsidiary_of",
            Self::Competitor => "competitor",
            Self::Partner => "partner",
            Self::Peer => "peer",
            Self::Supplier => "supplier",
            Self::Customer => "customer",
            Self::Investor => "investor",
            Self::CeoOf => "ceo_of",
            Self::FounderOf => "founder_of",
            Self::EmployeeOf => "employee_of",
        }
    }
}

/// A canonical entity in the knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub canonical_name: String,
    pub entity_type: EntityType,
    pub l3_root: String,
    pub l2_sector: String,
    pub attributes: serde_json::Value,
    pub mention_count: i64,
    pub first_mentioned: DateTime<Utc>,
    pub last_mentioned: DateTime<Utc>,
}

/// An entity as declared by the extractor, before resolution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub l3_root: String,
    #[serde(default)]
    pub l2_sector: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub sentiment: String,
    /// Which state dimension this unit moves for the entity, if any.
    #[serde(default)]
    pub state_dimension: String,
    /// Description of the asserted change.
    #[serde(default)]
    pub state_change: String,
}

/// A relation as declared by the extractor, before resolution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    pub relation_type: String,
    #[serde(default)]
    pub strength: f64,
    #[serde(default)]
    pub confidence: f64,
}

// --- Agent plumbing ---

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One agent's execution record within an analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTrace {
    pub agent: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub token_usage: TokenUsage,
    pub input_summary: String,
    pub output_summary: String,
    pub error: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Quick,
    Standard,
    Deep,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }
}

impl std::str::FromStr for AnalysisMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            other => Err(format!("unknown analysis mode: {other}")),
        }
    }
}

/// Legacy article-centric analysis result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedArticle {
    pub article: Article,
    pub core_summary: String,
    pub five_w1h: FiveW1H,
    pub entities: Vec<ExtractedEntity>,
    pub historical_context: String,
    pub related: Vec<RelatedHit>,
    pub analyst_reports: HashMap<String, serde_json::Value>,
    pub overall_score: f64,
    pub is_top_pick: bool,
    pub tags: Vec<String>,
    pub traces: Vec<AgentTrace>,
}

impl EnrichedArticle {
    /// Minimal enrichment derived from the raw article alone, used when the
    /// pipeline degrades.
    pub fn trivial(article: Article) -> Self {
        let core_summary = article.summary.clone();
        Self {
            article,
            core_summary,
            five_w1h: FiveW1H::default(),
            entities: Vec::new(),
            historical_context: String::new(),
            related: Vec::new(),
            analyst_reports: HashMap::new(),
            overall_score: 5.0,
            is_top_pick: false,
            tags: Vec::new(),
            traces: Vec::new(),
        }
    }
}

/// A neighbor surfaced by the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedHit {
    pub id: String,
    pub score: f64,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_normalization_rescales_and_clamps() {
        let scores = ValueScores {
            information_gain: 0.85,
            actionability: 7.0,
            scarcity: 11.0,
            impact_magnitude: -2.0,
        }
        .normalized();
        assert_eq!(scores.information_gain, 8.5);
        assert_eq!(scores.actionability, 7.0);
        assert_eq!(scores.scarcity, 10.0);
        assert_eq!(scores.impact_magnitude, 1.0);
    }

    #[test]
    fn value_score_weighting() {
        let scores = ValueScores {
            information_gain: 10.0,
            actionability: 10.0,
            scarcity: 10.0,
            impact_magnitude: 10.0,
        };
        assert!((scores.value_score() - 10.0).abs() < 1e-9);

        let scores = ValueScores {
            information_gain: 8.0,
            actionability: 4.0,
            scarcity: 2.0,
            impact_magnitude: 6.0,
        };
        // 0.30*8 + 0.25*4 + 0.20*2 + 0.25*6 = 2.4 + 1.0 + 0.4 + 1.5
        assert!((scores.value_score() - 5.3).abs() < 1e-9);
    }

    #[test]
    fn fingerprint_is_whitespace_and_case_insensitive() {
        let a = unit_fingerprint("OpenAI raises  $6B", "The round   values the\ncompany at $150B.");
        let b = unit_fingerprint("openai raises $6b", "the round values the company at $150b.");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn unit_id_uses_fingerprint_prefix() {
        let fp = unit_fingerprint("title", "content");
        let id = unit_id(&fp);
        assert!(id.starts_with("iu_"));
        assert_eq!(id.len(), 3 + 16);
        assert!(fp.starts_with(&id[3..]));
    }

    #[test]
    fn absorb_sources_dedups_by_url_and_tracks_count() {
        let mk = |url: &str| SourceReference {
            url: url.to_string(),
            title: String::new(),
            source_name: String::new(),
            published_at: None,
            excerpt: String::new(),
            credibility_tier: 3,
        };
        let mut unit = sample_unit();
        unit.sources = vec![mk("https://a.example/1")];
        unit.merged_count = 1;

        unit.absorb_sources(&[mk("https://a.example/1"), mk("https://b.example/2")]);
        assert_eq!(unit.sources.len(), 2);
        assert_eq!(unit.merged_count, 2);
    }

    #[test]
    fn state_dimension_round_trips_through_storage() {
        assert_eq!(StateDimension::to_storage(Some(StateDimension::Tech)), "TECH");
        assert_eq!(StateDimension::to_storage(None), "");
        assert_eq!(StateDimension::from_storage("CAPITAL"), Some(StateDimension::Capital));
        assert_eq!(StateDimension::from_storage(""), None);
        assert_eq!(StateDimension::from_storage("WEATHER"), None);
    }

    #[test]
    fn unknown_enum_labels_take_defaults() {
        assert_eq!(UnitType::parse("gossip"), UnitType::Fact);
        assert_eq!(TimeSensitivity::parse("someday"), TimeSensitivity::Normal);
        assert_eq!(EntityType::parse("ALIEN"), EntityType::Company);
        assert_eq!(MentionRole::parse("cameo"), MentionRole::Protagonist);
        assert_eq!(Sentiment::parse("ambivalent"), Sentiment::Neutral);
        assert!(RelationType::parse("nemesis_of").is_none());
    }

    pub(crate) fn sample_unit() -> InformationUnit {
        let fp = unit_fingerprint("t", "c");
        InformationUnit {
            id: unit_id(&fp),
            fingerprint: fp,
            unit_type: UnitType::Fact,
            title: "t".to_string(),
            content: "c".to_string(),
            summary: String::new(),
            event_time: None,
            report_time: Utc::now(),
            time_sensitivity: TimeSensitivity::Normal,
            five_w1h: FiveW1H::default(),
            key_insights: Vec::new(),
            scores: ValueScores::default(),
            state_change_type: None,
            state_change_subtypes: Vec::new(),
            entity_anchors: Vec::new(),
            sources: Vec::new(),
            primary_source: String::new(),
            merged_count: 1,
            is_sent: false,
            entity_processed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
