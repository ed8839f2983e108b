use std::sync::Arc;

use anyhow::Result;
use briefwire_common::{InformationUnit, StateDimension, TimeSensitivity, UnitType, ValueScores};
use briefwire_index::VectorIndex;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

/// Content-addressed information-unit persistence.
#[derive(Clone)]
pub struct InformationStore {
    pool: SqlitePool,
    index: Arc<dyn VectorIndex>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct UnitRow {
    id: String,
    fingerprint: String,
    unit_type: String,
    title: String,
    content: String,
    summary: String,
    event_time: Option<String>,
    report_time: DateTime<Utc>,
    time_sensitivity: String,
    five_w1h: String,
    key_insights: String,
    information_gain: f64,
    actionability: f64,
    scarcity: f64,
    impact_magnitude: f64,
    state_change_type: String,
    state_change_subtypes: String,
    entity_anchors: String,
    sources: String,
    primary_source: String,
    merged_count: i64,
    is_sent: bool,
    entity_processed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UnitRow {
    fn into_unit(self) -> InformationUnit {
        InformationUnit {
            id: self.id,
            fingerprint: self.fingerprint,
            unit_type: UnitType::parse(&self.unit_type),
            title: self.title,
            content: self.content,
            summary: self.summary,
            event_time: self.event_time,
            report_time: self.report_time,
            time_sensitivity: TimeSensitivity::parse(&self.time_sensitivity),
            five_w1h: decode_json(&self.five_w1h),
            key_insights: decode_json(&self.key_insights),
            scores: ValueScores {
                information_gain: self.information_gain,
                actionability: self.actionability,
                scarcity: self.scarcity,
                impact_magnitude: self.impact_magnitude,
            },
            state_change_type: StateDimension::from_storage(&self.state_change_type),
            state_change_subtypes: decode_json(&self.state_change_subtypes),
            entity_anchors: decode_json(&self.entity_anchors),
            sources: decode_json(&self.sources),
            primary_source: self.primary_source,
            merged_count: self.merged_count as u32,
            is_sent: self.is_sent,
            entity_processed: self.entity_processed,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn decode_json<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, "Malformed JSON column, using default");
        T::default()
    })
}

const SELECT_COLUMNS: &str = "id, fingerprint, unit_type, title, content, summary, event_time, \
     report_time, time_sensitivity, five_w1h, key_insights, information_gain, actionability, \
     scarcity, impact_magnitude, state_change_type, state_change_subtypes, entity_anchors, \
     sources, primary_source, merged_count, is_sent, entity_processed, created_at, updated_at";

impl InformationStore {
    pub fn new(pool: SqlitePool, index: Arc<dyn VectorIndex>) -> Self {
        Self { pool, index }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub async fn exists(&self, fingerprint: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM information_units WHERE fingerprint = ?1")
                .bind(fingerprint)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    pub async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<InformationUnit>> {
        let row = sqlx::query_as::<_, UnitRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM information_units WHERE fingerprint = ?1"
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UnitRow::into_unit))
    }

    pub async fn get(&self, id: &str) -> Result<Option<InformationUnit>> {
        let row = sqlx::query_as::<_, UnitRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM information_units WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UnitRow::into_unit))
    }

    /// Upsert by id. `created_at` of an existing row is preserved; every
    /// other column reflects the incoming unit.
    pub async fn save(&self, unit: &InformationUnit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO information_units
                (id, fingerprint, unit_type, title, content, summary, event_time,
                 event_time_parsed, report_time, time_sensitivity, five_w1h, key_insights,
                 information_gain, actionability, scarcity, impact_magnitude,
                 state_change_type, state_change_subtypes, entity_anchors, sources,
                 primary_source, merged_count, is_sent, entity_processed, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
            ON CONFLICT(id) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                unit_type = excluded.unit_type,
                title = excluded.title,
                content = excluded.content,
                summary = excluded.summary,
                event_time = excluded.event_time,
                event_time_parsed = excluded.event_time_parsed,
                report_time = excluded.report_time,
                time_sensitivity = excluded.time_sensitivity,
                five_w1h = excluded.five_w1h,
                key_insights = excluded.key_insights,
                information_gain = excluded.information_gain,
                actionability = excluded.actionability,
                scarcity = excluded.scarcity,
                impact_magnitude = excluded.impact_magnitude,
                state_change_type = excluded.state_change_type,
                state_change_subtypes = excluded.state_change_subtypes,
                entity_anchors = excluded.entity_anchors,
                sources = excluded.sources,
                primary_source = excluded.primary_source,
                merged_count = excluded.merged_count,
                is_sent = excluded.is_sent,
                entity_processed = excluded.entity_processed,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&unit.id)
        .bind(&unit.fingerprint)
        .bind(unit.unit_type.as_str())
        .bind(&unit.title)
        .bind(&unit.content)
        .bind(&unit.summary)
        .bind(&unit.event_time)
        .bind(unit.event_time.as_deref().and_then(parse_event_time))
        .bind(unit.report_time)
        .bind(unit.time_sensitivity.as_str())
        .bind(serde_json::to_string(&unit.five_w1h)?)
        .bind(serde_json::to_string(&unit.key_insights)?)
        .bind(unit.scores.information_gain)
        .bind(unit.scores.actionability)
        .bind(unit.scores.scarcity)
        .bind(unit.scores.impact_magnitude)
        .bind(StateDimension::to_storage(unit.state_change_type))
        .bind(serde_json::to_string(&unit.state_change_subtypes)?)
        .bind(serde_json::to_string(&unit.entity_anchors)?)
        .bind(serde_json::to_string(&unit.sources)?)
        .bind(&unit.primary_source)
        .bind(unit.merged_count as i64)
        .bind(unit.is_sent)
        .bind(unit.entity_processed)
        .bind(unit.created_at)
        .bind(unit.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Semantically similar stored units, best first; ties broken by the
    /// earliest creation time. The candidate itself is excluded.
    pub async fn find_similar(
        &self,
        unit: &InformationUnit,
        threshold: f64,
        top_k: usize,
    ) -> Result<Vec<(InformationUnit, f64)>> {
        let hits = self.index.search(&unit.index_text(), top_k.max(8)).await?;

        let mut matches = Vec::new();
        for hit in hits {
            if hit.id == unit.id || hit.score < threshold {
                continue;
            }
            if let Some(stored) = self.get(&hit.id).await? {
                matches.push((stored, hit.score));
            }
        }

        matches.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.created_at.cmp(&b.0.created_at))
        });
        matches.truncate(top_k);

        debug!(unit = %unit.id, matches = matches.len(), "semantic lookup");
        Ok(matches)
    }

    /// Index a unit for future semantic lookups.
    pub async fn index_unit(&self, unit: &InformationUnit) -> Result<()> {
        self.index
            .add(
                &unit.id,
                &unit.title,
                &unit.index_text(),
                serde_json::json!({ "fingerprint": unit.fingerprint }),
            )
            .await
    }

    pub async fn get_unsent(&self, limit: i64) -> Result<Vec<InformationUnit>> {
        let rows = sqlx::query_as::<_, UnitRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM information_units WHERE is_sent = 0 \
             ORDER BY COALESCE(event_time_parsed, created_at) DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UnitRow::into_unit).collect())
    }

    /// Mark units sent, stamping the emission time, in one transaction.
    pub async fn mark_sent(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE information_units SET is_sent = 1, sent_at = ?1, updated_at = ?1 \
                 WHERE id = ?2",
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Titles and summaries of recently sent units, for history avoidance.
    pub async fn recent_sent_digest_entries(&self, limit: i64) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT title, summary FROM information_units WHERE is_sent = 1 \
             ORDER BY sent_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_entity_processed(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE information_units SET entity_processed = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Units the entity pipeline has not seen yet. The flag is set for every
    /// processed unit, including ones with zero extracted entities, so this
    /// sweep always converges.
    pub async fn get_unprocessed_entities(&self, limit: i64) -> Result<Vec<InformationUnit>> {
        let rows = sqlx::query_as::<_, UnitRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM information_units WHERE entity_processed = 0 \
             ORDER BY created_at ASC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UnitRow::into_unit).collect())
    }

    pub async fn cleanup(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = sqlx::query("DELETE FROM information_units WHERE created_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM information_units")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Best-effort parse of an event-time string for ordering. Relative prose
/// ("last Tuesday") stays unparsed and falls back to created_at.
fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use briefwire_common::{unit_fingerprint, unit_id, FiveW1H, SourceReference};
    use briefwire_index::HashedIndex;

    fn make_unit(title: &str, content: &str) -> InformationUnit {
        let fingerprint = unit_fingerprint(title, content);
        InformationUnit {
            id: unit_id(&fingerprint),
            fingerprint,
            unit_type: UnitType::Fact,
            title: title.to_string(),
            content: content.to_string(),
            summary: content.to_string(),
            event_time: None,
            report_time: Utc::now(),
            time_sensitivity: TimeSensitivity::Normal,
            five_w1h: FiveW1H::default(),
            key_insights: vec!["insight".to_string()],
            scores: ValueScores {
                information_gain: 7.0,
                actionability: 6.0,
                scarcity: 5.0,
                impact_magnitude: 8.0,
            },
            state_change_type: Some(StateDimension::Tech),
            state_change_subtypes: Vec::new(),
            entity_anchors: Vec::new(),
            sources: vec![SourceReference {
                url: format!("https://example.com/{}", title.replace(' ', "-")),
                title: title.to_string(),
                source_name: "Example".to_string(),
                published_at: None,
                excerpt: String::new(),
                credibility_tier: 3,
            }],
            primary_source: "https://example.com/src".to_string(),
            merged_count: 1,
            is_sent: false,
            entity_processed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn store() -> InformationStore {
        let pool = crate::connect_memory().await.unwrap();
        InformationStore::new(pool, Arc::new(HashedIndex::new()))
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = store().await;
        let unit = make_unit("OpenAI ships a new model", "The model outperforms prior versions.");
        store.save(&unit).await.unwrap();

        let loaded = store.get(&unit.id).await.unwrap().unwrap();
        assert_eq!(loaded.fingerprint, unit.fingerprint);
        assert_eq!(loaded.unit_type, UnitType::Fact);
        assert_eq!(loaded.scores.information_gain, 7.0);
        assert_eq!(loaded.state_change_type, Some(StateDimension::Tech));
        assert_eq!(loaded.sources.len(), 1);
        assert_eq!(loaded.merged_count, 1);

        assert!(store.exists(&unit.fingerprint).await.unwrap());
        let by_fp = store.get_by_fingerprint(&unit.fingerprint).await.unwrap().unwrap();
        assert_eq!(by_fp.id, unit.id);
    }

    #[tokio::test]
    async fn save_upserts_by_id_and_preserves_created_at() {
        let store = store().await;
        let mut unit = make_unit("title", "content");
        let original_created = unit.created_at;
        store.save(&unit).await.unwrap();

        unit.summary = "updated".to_string();
        unit.merged_count = 2;
        unit.created_at = Utc::now() + Duration::days(1);
        store.save(&unit).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let loaded = store.get(&unit.id).await.unwrap().unwrap();
        assert_eq!(loaded.summary, "updated");
        assert_eq!(loaded.merged_count, 2);
        assert_eq!(loaded.created_at.timestamp(), original_created.timestamp());
    }

    #[tokio::test]
    async fn find_similar_ranks_and_tie_breaks() {
        let store = store().await;

        let mut older = make_unit(
            "OpenAI raises six billion in funding",
            "OpenAI closed a six billion dollar round.",
        );
        older.created_at = Utc::now() - Duration::days(1);
        let newer = make_unit(
            "OpenAI raises 6B in funding round",
            "OpenAI closed a 6B dollar funding round.",
        );
        store.save(&older).await.unwrap();
        store.save(&newer).await.unwrap();
        store.index_unit(&older).await.unwrap();
        store.index_unit(&newer).await.unwrap();

        let candidate = make_unit(
            "OpenAI raises six billion funding",
            "OpenAI closed a six billion funding round.",
        );
        let matches = store.find_similar(&candidate, 0.6, 3).await.unwrap();
        assert!(!matches.is_empty());
        // Best score first; scores are true cosines.
        for pair in matches.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
        for (_, score) in &matches {
            assert!(*score >= 0.6 && *score <= 1.0 + 1e-9);
        }
    }

    #[tokio::test]
    async fn unsent_ordering_prefers_event_time() {
        let store = store().await;

        let mut with_event = make_unit("event unit", "has an explicit event time");
        with_event.event_time = Some("2031-01-01".to_string());
        with_event.created_at = Utc::now() - Duration::days(2);

        let plain = make_unit("plain unit", "ordered by creation");
        store.save(&plain).await.unwrap();
        store.save(&with_event).await.unwrap();

        let unsent = store.get_unsent(10).await.unwrap();
        assert_eq!(unsent[0].id, with_event.id);
    }

    #[tokio::test]
    async fn mark_sent_excludes_from_unsent() {
        let store = store().await;
        let a = make_unit("a", "content a");
        let b = make_unit("b", "content b");
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        store.mark_sent(&[a.id.clone()]).await.unwrap();

        let unsent = store.get_unsent(10).await.unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].id, b.id);

        let recent = store.recent_sent_digest_entries(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].0, "a");
    }

    #[tokio::test]
    async fn entity_backfill_sweep_converges() {
        let store = store().await;
        let unit = make_unit("no entities here", "still must be flagged");
        store.save(&unit).await.unwrap();

        assert_eq!(store.get_unprocessed_entities(10).await.unwrap().len(), 1);
        store.mark_entity_processed(&unit.id).await.unwrap();
        assert!(store.get_unprocessed_entities(10).await.unwrap().is_empty());
    }

    #[test]
    fn event_time_parsing_variants() {
        assert!(parse_event_time("2030-06-01T12:00:00Z").is_some());
        assert!(parse_event_time("2030-06-01 12:00:00").is_some());
        assert!(parse_event_time("2030-06-01").is_some());
        assert!(parse_event_time("last Tuesday").is_none());
        assert!(parse_event_time("").is_none());
    }
}
