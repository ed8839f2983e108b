use briefwire_common::InformationUnit;
use chrono::Utc;

const NAME: &str = "merger";

/// Deterministic multi-source merge. The first unit is the surviving
/// identity; everything else folds into it. No model call involved.
pub struct Merger;

impl Merger {
    pub fn name() -> &'static str {
        NAME
    }

    /// Merge `rest` into `base`. Rules:
    /// - id, fingerprint, and created_at of `base` are preserved;
    /// - content becomes the order-preserving union of sentences;
    /// - key_insights union, case-insensitively deduplicated;
    /// - information_gain and actionability are scarcity-weighted averages;
    /// - scarcity and impact_magnitude take the max;
    /// - sources union by URL; merged_count tracks the unique-source count.
    pub fn merge(base: InformationUnit, rest: &[InformationUnit]) -> InformationUnit {
        let mut merged = base;
        if rest.is_empty() {
            return merged;
        }

        let all: Vec<&InformationUnit> = std::iter::once(&merged).chain(rest.iter()).collect();

        // Scores first, while `all` can still borrow `merged`.
        let weighted = |pick: fn(&InformationUnit) -> f64| -> f64 {
            let weight_sum: f64 = all.iter().map(|u| u.scores.scarcity).sum();
            if weight_sum > 0.0 {
                all.iter()
                    .map(|u| pick(u) * u.scores.scarcity)
                    .sum::<f64>()
                    / weight_sum
            } else {
                all.iter().map(|u| pick(u)).sum::<f64>() / all.len() as f64
            }
        };
        let information_gain = weighted(|u| u.scores.information_gain);
        let actionability = weighted(|u| u.scores.actionability);
        let scarcity = all
            .iter()
            .map(|u| u.scores.scarcity)
            .fold(f64::MIN, f64::max);
        let impact_magnitude = all
            .iter()
            .map(|u| u.scores.impact_magnitude)
            .fold(f64::MIN, f64::max);

        // Sentence-level content union, first occurrence wins.
        let mut seen_sentences: Vec<String> = Vec::new();
        let mut content_parts: Vec<String> = Vec::new();
        for unit in &all {
            for sentence in split_sentences(&unit.content) {
                let key = sentence_key(&sentence);
                if key.is_empty() || seen_sentences.contains(&key) {
                    continue;
                }
                seen_sentences.push(key);
                content_parts.push(sentence);
            }
        }

        // Insight union.
        let mut seen_insights: Vec<String> = Vec::new();
        let mut insights: Vec<String> = Vec::new();
        for unit in &all {
            for insight in &unit.key_insights {
                let key = sentence_key(insight);
                if key.is_empty() || seen_insights.contains(&key) {
                    continue;
                }
                seen_insights.push(key);
                insights.push(insight.clone());
            }
        }

        if merged.event_time.is_none() {
            merged.event_time = rest.iter().find_map(|u| u.event_time.clone());
        }

        let incoming: Vec<_> = rest.iter().flat_map(|u| u.sources.clone()).collect();
        merged.absorb_sources(&incoming);

        merged.content = content_parts.join(" ");
        merged.key_insights = insights;
        merged.scores.information_gain = information_gain;
        merged.scores.actionability = actionability;
        merged.scores.scarcity = scarcity;
        merged.scores.impact_magnitude = impact_magnitude;
        merged.updated_at = Utc::now();
        merged
    }
}

/// Split text into sentences, keeping terminal punctuation.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map(|n| n.is_whitespace()).unwrap_or(true);
            if at_boundary {
                let trimmed = current.trim().to_string();
                if !trimmed.is_empty() {
                    sentences.push(trimmed);
                }
                current.clear();
            }
        }
    }
    let trimmed = current.trim().to_string();
    if !trimmed.is_empty() {
        sentences.push(trimmed);
    }
    sentences
}

/// Normalization key for sentence/insight deduplication.
fn sentence_key(sentence: &str) -> String {
    sentence
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
