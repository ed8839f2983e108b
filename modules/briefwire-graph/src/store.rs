use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::Result;
use briefwire_common::{
    Entity, EntityType, ExtractedEntity, ExtractedRelation, MentionRole, RelationType, Sentiment,
    StateDimension,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Entity graph persistence. Shares the application pool; tables are created
/// by [`EntityStore::init`].
#[derive(Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HotEntity {
    pub entity: Entity,
    pub window_mentions: i64,
    pub trend: MentionTrend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionTrend {
    Up,
    Down,
    Stable,
    New,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub unit_id: String,
    pub role: MentionRole,
    pub sentiment: Sentiment,
    pub state_dimension: Option<StateDimension>,
    pub state_delta: String,
    pub event_time: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEdge {
    pub source_id: String,
    pub target_id: String,
    pub relation_type: RelationType,
    pub strength: f64,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

/// Ego network around one entity, bounded by BFS depth.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkGraph {
    pub center: String,
    pub nodes: Vec<Entity>,
    pub edges: Vec<NetworkEdge>,
}

/// Case-fold and trim an alias for lookup.
fn fold_alias(name: &str) -> String {
    name.trim().to_lowercase()
}

impl EntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the graph tables if they don't exist.
    pub async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                canonical_name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                l3_root TEXT NOT NULL DEFAULT '',
                l2_sector TEXT NOT NULL DEFAULT '',
                attributes TEXT NOT NULL DEFAULT '{}',
                mention_count INTEGER NOT NULL DEFAULT 0,
                first_mentioned TEXT NOT NULL,
                last_mentioned TEXT NOT NULL,
                UNIQUE(canonical_name COLLATE NOCASE, entity_type)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS entity_aliases (
                alias TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL REFERENCES entities(id),
                is_primary INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS entity_mentions (
                entity_id TEXT NOT NULL REFERENCES entities(id),
                unit_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'protagonist',
                sentiment TEXT NOT NULL DEFAULT 'neutral',
                state_dimension TEXT NOT NULL DEFAULT '',
                state_delta TEXT NOT NULL DEFAULT '',
                event_time TEXT,
                recorded_at TEXT NOT NULL,
                UNIQUE(entity_id, unit_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS entity_relations (
                source_id TEXT NOT NULL REFERENCES entities(id),
                target_id TEXT NOT NULL REFERENCES entities(id),
                relation_type TEXT NOT NULL,
                strength REAL NOT NULL DEFAULT 0.5,
                confidence REAL NOT NULL DEFAULT 0.5,
                evidence TEXT NOT NULL DEFAULT '[]',
                valid_from TEXT,
                valid_to TEXT,
                UNIQUE(source_id, target_id, relation_type)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_mentions_unit ON entity_mentions(unit_id)",
            "CREATE INDEX IF NOT EXISTS idx_mentions_recorded ON entity_mentions(recorded_at)",
            "CREATE INDEX IF NOT EXISTS idx_relations_target ON entity_relations(target_id)",
        ];
        for ddl in statements {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    // --- Write path ---

    /// Resolve, upsert, and record everything the extractor produced for one
    /// unit. Returns extracted name → entity id. Idempotent: repeating the
    /// call with the same unit does not double-count mentions.
    pub async fn process_extracted(
        &self,
        unit_id: &str,
        entities: &[ExtractedEntity],
        relations: &[ExtractedRelation],
        event_time: Option<DateTime<Utc>>,
    ) -> Result<HashMap<String, String>> {
        let mut resolved: HashMap<String, String> = HashMap::new();

        for extracted in entities {
            if extracted.name.trim().is_empty() {
                continue;
            }
            let entity_id = self.ensure_entity(extracted, event_time).await?;
            self.record_mention(&entity_id, unit_id, extracted, event_time)
                .await?;
            resolved.insert(extracted.name.clone(), entity_id);
        }

        for relation in relations {
            let Some(relation_type) = RelationType::parse(&relation.relation_type) else {
                warn!(
                    relation_type = relation.relation_type,
                    "Unknown relation type, skipping"
                );
                continue;
            };
            let source_id = match resolved.get(&relation.source) {
                Some(id) => id.clone(),
                None => {
                    self.ensure_named_entity(&relation.source, EntityType::Company, event_time)
                        .await?
                }
            };
            let target_id = match resolved.get(&relation.target) {
                Some(id) => id.clone(),
                None => {
                    self.ensure_named_entity(&relation.target, EntityType::Company, event_time)
                        .await?
                }
            };
            self.upsert_relation(
                &source_id,
                &target_id,
                relation_type,
                relation.strength.clamp(0.0, 1.0),
                relation.confidence.clamp(0.0, 1.0),
                unit_id,
                event_time,
            )
            .await?;
        }

        debug!(
            unit_id,
            entities = resolved.len(),
            relations = relations.len(),
            "entity write path complete"
        );
        Ok(resolved)
    }

    /// Alias-resolve or create the entity for an extraction.
    async fn ensure_entity(
        &self,
        extracted: &ExtractedEntity,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<String> {
        if let Some(id) = self.find_by_alias(&extracted.name).await? {
            return Ok(id);
        }

        let entity_type = EntityType::parse(&extracted.entity_type);
        let id = format!("ent_{}", Uuid::new_v4().simple());
        let seed_time = event_time.unwrap_or_else(Utc::now);

        // Another writer may land the same canonical name first; fall back
        // to lookup when the unique constraint fires.
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO entities
                (id, canonical_name, entity_type, l3_root, l2_sector, mention_count,
                 first_mentioned, last_mentioned)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
            "#,
        )
        .bind(&id)
        .bind(extracted.name.trim())
        .bind(entity_type.as_str())
        .bind(&extracted.l3_root)
        .bind(&extracted.l2_sector)
        .bind(seed_time)
        .execute(&self.pool)
        .await?;

        let entity_id = if inserted.rows_affected() == 0 {
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT id FROM entities WHERE canonical_name = ?1 COLLATE NOCASE \
                 AND entity_type = ?2",
            )
            .bind(extracted.name.trim())
            .bind(entity_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
            existing.unwrap_or(id)
        } else {
            id
        };

        // Register the canonical name (primary) plus any declared aliases.
        self.register_alias(&extracted.name, &entity_id, true).await?;
        for alias in &extracted.aliases {
            self.register_alias(alias, &entity_id, false).await?;
        }

        Ok(entity_id)
    }

    /// Bare-name variant used for relation endpoints the extractor didn't
    /// describe as entities.
    async fn ensure_named_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let extracted = ExtractedEntity {
            name: name.to_string(),
            entity_type: entity_type.as_str().to_string(),
            ..Default::default()
        };
        self.ensure_entity(&extracted, event_time).await
    }

    async fn register_alias(&self, alias: &str, entity_id: &str, primary: bool) -> Result<()> {
        let folded = fold_alias(alias);
        if folded.is_empty() {
            return Ok(());
        }
        // First writer wins; an alias never migrates between entities here.
        sqlx::query("INSERT OR IGNORE INTO entity_aliases (alias, entity_id, is_primary) VALUES (?1, ?2, ?3)")
            .bind(&folded)
            .bind(entity_id)
            .bind(primary)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_mention(
        &self,
        entity_id: &str,
        unit_id: &str,
        extracted: &ExtractedEntity,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let role = if extracted.role.is_empty() {
            MentionRole::Protagonist
        } else {
            MentionRole::parse(&extracted.role)
        };
        let sentiment = Sentiment::parse(&extracted.sentiment);
        let dimension = StateDimension::parse(&extracted.state_dimension);
        let now = Utc::now();

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO entity_mentions
                (entity_id, unit_id, role, sentiment, state_dimension, state_delta,
                 event_time, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(entity_id)
        .bind(unit_id)
        .bind(role.as_str())
        .bind(sentiment.as_str())
        .bind(StateDimension::to_storage(dimension))
        .bind(&extracted.state_change)
        .bind(event_time)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            // First mention of this unit: bump the counter and fold the
            // mention window. last_mentioned never moves backwards.
            let mentioned_at = event_time.unwrap_or(now);
            sqlx::query(
                r#"
                UPDATE entities SET
                    mention_count = mention_count + 1,
                    first_mentioned = MIN(first_mentioned, ?1),
                    last_mentioned = MAX(last_mentioned, ?1)
                WHERE id = ?2
                "#,
            )
            .bind(mentioned_at)
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        } else {
            // Repeat write for the same (entity, unit): refresh mention
            // fields, leave the counter alone.
            sqlx::query(
                r#"
                UPDATE entity_mentions SET
                    role = ?1, sentiment = ?2, state_dimension = ?3, state_delta = ?4,
                    event_time = COALESCE(?5, event_time)
                WHERE entity_id = ?6 AND unit_id = ?7
                "#,
            )
            .bind(role.as_str())
            .bind(sentiment.as_str())
            .bind(StateDimension::to_storage(dimension))
            .bind(&extracted.state_change)
            .bind(event_time)
            .bind(entity_id)
            .bind(unit_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert_relation(
        &self,
        source_id: &str,
        target_id: &str,
        relation_type: RelationType,
        strength: f64,
        confidence: f64,
        evidence_unit: &str,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT evidence FROM entity_relations \
             WHERE source_id = ?1 AND target_id = ?2 AND relation_type = ?3",
        )
        .bind(source_id)
        .bind(target_id)
        .bind(relation_type.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let mut evidence: Vec<String> = existing
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        if !evidence.iter().any(|e| e == evidence_unit) {
            evidence.push(evidence_unit.to_string());
        }

        sqlx::query(
            r#"
            INSERT INTO entity_relations
                (source_id, target_id, relation_type, strength, confidence, evidence, valid_from)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(source_id, target_id, relation_type) DO UPDATE SET
                strength = MAX(entity_relations.strength, excluded.strength),
                confidence = MAX(entity_relations.confidence, excluded.confidence),
                evidence = excluded.evidence
            "#,
        )
        .bind(source_id)
        .bind(target_id)
        .bind(relation_type.as_str())
        .bind(strength)
        .bind(confidence)
        .bind(serde_json::to_string(&evidence)?)
        .bind(event_time.unwrap_or_else(Utc::now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // --- Reads ---

    pub async fn find_by_alias(&self, name: &str) -> Result<Option<String>> {
        let folded = fold_alias(name);
        if folded.is_empty() {
            return Ok(None);
        }
        let id: Option<String> =
            sqlx::query_scalar("SELECT entity_id FROM entity_aliases WHERE alias = ?1")
                .bind(&folded)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(
            "SELECT id, canonical_name, entity_type, l3_root, l2_sector, attributes, \
             mention_count, first_mentioned, last_mentioned FROM entities WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| entity_from_row(&r)))
    }

    /// Most-mentioned entities in the window, with trend against the prior
    /// equal-length window.
    pub async fn get_hot_entities(&self, days: i64, limit: i64) -> Result<Vec<HotEntity>> {
        let now = Utc::now();
        let window_start = now - Duration::days(days);
        let prior_start = window_start - Duration::days(days);

        let rows = sqlx::query(
            r#"
            SELECT e.id, e.canonical_name, e.entity_type, e.l3_root, e.l2_sector,
                   e.attributes, e.mention_count, e.first_mentioned, e.last_mentioned,
                   COUNT(m.unit_id) AS window_mentions
            FROM entities e
            JOIN entity_mentions m ON m.entity_id = e.id
            WHERE m.recorded_at >= ?1
            GROUP BY e.id
            ORDER BY window_mentions DESC, e.mention_count DESC
            LIMIT ?2
            "#,
        )
        .bind(window_start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut hot = Vec::with_capacity(rows.len());
        for row in rows {
            let entity = entity_from_row(&row);
            let window_mentions: i64 = row.get("window_mentions");

            let prior_mentions: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM entity_mentions \
                 WHERE entity_id = ?1 AND recorded_at >= ?2 AND recorded_at < ?3",
            )
            .bind(&entity.id)
            .bind(prior_start)
            .bind(window_start)
            .fetch_one(&self.pool)
            .await?;

            let trend = if prior_mentions == 0 {
                MentionTrend::New
            } else if window_mentions as f64 > prior_mentions as f64 * 1.2 {
                MentionTrend::Up
            } else if (window_mentions as f64) < prior_mentions as f64 * 0.8 {
                MentionTrend::Down
            } else {
                MentionTrend::Stable
            };

            hot.push(HotEntity {
                entity,
                window_mentions,
                trend,
            });
        }

        Ok(hot)
    }

    /// Chronological mentions for one entity, optionally filtered to a set
    /// of state dimensions.
    pub async fn get_entity_timeline(
        &self,
        entity_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        dimensions: &[StateDimension],
        limit: i64,
    ) -> Result<Vec<TimelineEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT unit_id, role, sentiment, state_dimension, state_delta,
                   event_time, recorded_at
            FROM entity_mentions
            WHERE entity_id = ?1
              AND COALESCE(event_time, recorded_at) >= COALESCE(?2, '0001-01-01')
              AND COALESCE(event_time, recorded_at) <= COALESCE(?3, '9999-12-31')
            ORDER BY COALESCE(event_time, recorded_at) ASC
            LIMIT ?4
            "#,
        )
        .bind(entity_id)
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let wanted: HashSet<&str> = dimensions.iter().map(|d| d.as_str()).collect();
        let entries = rows
            .into_iter()
            .map(|row| TimelineEntry {
                unit_id: row.get("unit_id"),
                role: MentionRole::parse(row.get("role")),
                sentiment: Sentiment::parse(row.get("sentiment")),
                state_dimension: StateDimension::from_storage(row.get("state_dimension")),
                state_delta: row.get("state_delta"),
                event_time: row.get("event_time"),
                recorded_at: row.get("recorded_at"),
            })
            .filter(|entry| {
                wanted.is_empty()
                    || entry
                        .state_dimension
                        .map(|d| wanted.contains(d.as_str()))
                        .unwrap_or(false)
            })
            .collect();

        Ok(entries)
    }

    /// BFS ego network to the given depth over the relation edge table.
    pub async fn get_entity_network(&self, entity_id: &str, depth: u32) -> Result<NetworkGraph> {
        let mut nodes: Vec<Entity> = Vec::new();
        let mut edges: Vec<NetworkEdge> = Vec::new();
        let mut seen_nodes: HashSet<String> = HashSet::new();
        let mut seen_edges: HashSet<(String, String, &'static str)> = HashSet::new();

        let Some(center) = self.get_entity(entity_id).await? else {
            return Ok(NetworkGraph {
                center: entity_id.to_string(),
                nodes,
                edges,
            });
        };
        seen_nodes.insert(center.id.clone());
        nodes.push(center);

        let mut frontier: VecDeque<(String, u32)> = VecDeque::new();
        frontier.push_back((entity_id.to_string(), 0));

        while let Some((current, level)) = frontier.pop_front() {
            if level >= depth {
                continue;
            }

            let rows = sqlx::query(
                "SELECT source_id, target_id, relation_type, strength, confidence, evidence \
                 FROM entity_relations \
                 WHERE (source_id = ?1 OR target_id = ?1) AND valid_to IS NULL",
            )
            .bind(&current)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let source_id: String = row.get("source_id");
                let target_id: String = row.get("target_id");
                let Some(relation_type) = RelationType::parse(row.get("relation_type")) else {
                    continue;
                };

                if !seen_edges.insert((source_id.clone(), target_id.clone(), relation_type.as_str()))
                {
                    continue;
                }

                let evidence: Vec<String> =
                    serde_json::from_str(row.get::<String, _>("evidence").as_str())
                        .unwrap_or_default();
                edges.push(NetworkEdge {
                    source_id: source_id.clone(),
                    target_id: target_id.clone(),
                    relation_type,
                    strength: row.get("strength"),
                    confidence: row.get("confidence"),
                    evidence,
                });

                for neighbor in [source_id, target_id] {
                    if seen_nodes.insert(neighbor.clone()) {
                        if let Some(entity) = self.get_entity(&neighbor).await? {
                            nodes.push(entity);
                        }
                        frontier.push_back((neighbor, level + 1));
                    }
                }
            }
        }

        info!(
            center = entity_id,
            depth,
            nodes = nodes.len(),
            edges = edges.len(),
            "ego network assembled"
        );
        Ok(NetworkGraph {
            center: entity_id.to_string(),
            nodes,
            edges,
        })
    }

    pub async fn count_entities(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_relations(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM entity_relations")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_mentions(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM entity_mentions")
            .fetch_one(&self.pool)
            .await?)
    }
}

fn entity_from_row(row: &sqlx::sqlite::SqliteRow) -> Entity {
    let attributes: serde_json::Value =
        serde_json::from_str(row.get::<String, _>("attributes").as_str())
            .unwrap_or(serde_json::Value::Object(Default::default()));
    Entity {
        id: row.get("id"),
        canonical_name: row.get("canonical_name"),
        entity_type: EntityType::parse(row.get("entity_type")),
        l3_root: row.get("l3_root"),
        l2_sector: row.get("l2_sector"),
        attributes,
        mention_count: row.get("mention_count"),
        first_mentioned: row.get("first_mentioned"),
        last_mentioned: row.get("last_mentioned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> EntityStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = EntityStore::new(pool);
        store.init().await.unwrap();
        store
    }

    fn extracted(name: &str) -> ExtractedEntity {
        ExtractedEntity {
            name: name.to_string(),
            entity_type: "COMPANY".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_resolve_by_alias() {
        let store = store().await;
        let mut entity = extracted("OpenAI");
        entity.aliases = vec!["Open AI".to_string()];

        let resolved = store
            .process_extracted("iu_1", &[entity], &[], None)
            .await
            .unwrap();
        let id = resolved["OpenAI"].clone();

        // Case-folded and trimmed lookups hit the same entity.
        assert_eq!(store.find_by_alias("openai").await.unwrap(), Some(id.clone()));
        assert_eq!(store.find_by_alias("  OPEN ai ").await.unwrap(), Some(id.clone()));

        // A later mention of the alias resolves instead of creating.
        let resolved = store
            .process_extracted("iu_2", &[extracted("open ai")], &[], None)
            .await
            .unwrap();
        assert_eq!(resolved["open ai"], id);
        assert_eq!(store.count_entities().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn process_extracted_is_idempotent() {
        let store = store().await;
        let entities = vec![extracted("Nvidia")];
        let relations = vec![ExtractedRelation {
            source: "Nvidia".to_string(),
            target: "TSMC".to_string(),
            relation_type: "supplier".to_string(),
            strength: 0.6,
            confidence: 0.7,
        }];

        store
            .process_extracted("iu_1", &entities, &relations, None)
            .await
            .unwrap();
        store
            .process_extracted("iu_1", &entities, &relations, None)
            .await
            .unwrap();

        assert_eq!(store.count_entities().await.unwrap(), 2);
        assert_eq!(store.count_mentions().await.unwrap(), 1);
        assert_eq!(store.count_relations().await.unwrap(), 1);

        let id = store.find_by_alias("Nvidia").await.unwrap().unwrap();
        let entity = store.get_entity(&id).await.unwrap().unwrap();
        assert_eq!(entity.mention_count, 1);
    }

    #[tokio::test]
    async fn relation_upsert_merges_evidence_and_takes_max() {
        let store = store().await;
        let relation = |strength: f64, confidence: f64| ExtractedRelation {
            source: "A Corp".to_string(),
            target: "B Corp".to_string(),
            relation_type: "competitor".to_string(),
            strength,
            confidence,
        };

        store
            .process_extracted("iu_1", &[], &[relation(0.4, 0.9)], None)
            .await
            .unwrap();
        store
            .process_extracted("iu_2", &[], &[relation(0.8, 0.3)], None)
            .await
            .unwrap();

        assert_eq!(store.count_relations().await.unwrap(), 1);
        let id = store.find_by_alias("A Corp").await.unwrap().unwrap();
        let network = store.get_entity_network(&id, 1).await.unwrap();
        assert_eq!(network.edges.len(), 1);
        let edge = &network.edges[0];
        assert_eq!(edge.strength, 0.8);
        assert_eq!(edge.confidence, 0.9);
        assert_eq!(edge.evidence, vec!["iu_1", "iu_2"]);
    }

    #[tokio::test]
    async fn last_mentioned_never_moves_backwards() {
        let store = store().await;
        let recent = Utc::now();
        let earlier = recent - Duration::days(30);

        store
            .process_extracted("iu_1", &[extracted("Tesla")], &[], Some(recent))
            .await
            .unwrap();
        store
            .process_extracted("iu_2", &[extracted("Tesla")], &[], Some(earlier))
            .await
            .unwrap();

        let id = store.find_by_alias("Tesla").await.unwrap().unwrap();
        let entity = store.get_entity(&id).await.unwrap().unwrap();
        assert_eq!(entity.mention_count, 2);
        assert_eq!(entity.last_mentioned.timestamp(), recent.timestamp());
        assert_eq!(entity.first_mentioned.timestamp(), earlier.timestamp());
    }

    #[tokio::test]
    async fn hot_entities_report_trend() {
        let store = store().await;
        for i in 0..3 {
            store
                .process_extracted(&format!("iu_{i}"), &[extracted("HotCo")], &[], None)
                .await
                .unwrap();
        }

        let hot = store.get_hot_entities(7, 10).await.unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].entity.canonical_name, "HotCo");
        assert_eq!(hot[0].window_mentions, 3);
        // No mentions in the prior window.
        assert_eq!(hot[0].trend, MentionTrend::New);
    }

    #[tokio::test]
    async fn timeline_is_chronological_and_filterable() {
        let store = store().await;
        let t1 = Utc::now() - Duration::days(3);
        let t2 = Utc::now() - Duration::days(1);

        let mut with_dim = extracted("Meta");
        with_dim.state_dimension = "CAPITAL".to_string();
        with_dim.state_change = "raised debt".to_string();
        store
            .process_extracted("iu_2", &[with_dim], &[], Some(t2))
            .await
            .unwrap();

        let mut tech = extracted("Meta");
        tech.state_dimension = "TECH".to_string();
        tech.state_change = "shipped model".to_string();
        store
            .process_extracted("iu_1", &[tech], &[], Some(t1))
            .await
            .unwrap();

        let id = store.find_by_alias("Meta").await.unwrap().unwrap();
        let timeline = store
            .get_entity_timeline(&id, None, None, &[], 10)
            .await
            .unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].unit_id, "iu_1");
        assert_eq!(timeline[1].unit_id, "iu_2");

        let capital_only = store
            .get_entity_timeline(&id, None, None, &[StateDimension::Capital], 10)
            .await
            .unwrap();
        assert_eq!(capital_only.len(), 1);
        assert_eq!(capital_only[0].state_delta, "raised debt");
    }

    #[tokio::test]
    async fn network_bfs_respects_depth() {
        let store = store().await;
        // A -> B -> C chain.
        store
            .process_extracted(
                "iu_1",
                &[],
                &[ExtractedRelation {
                    source: "A".to_string(),
                    target: "B".to_string(),
                    relation_type: "partner".to_string(),
                    strength: 0.5,
                    confidence: 0.5,
                }],
                None,
            )
            .await
            .unwrap();
        store
            .process_extracted(
                "iu_2",
                &[],
                &[ExtractedRelation {
                    source: "B".to_string(),
                    target: "C".to_string(),
                    relation_type: "partner".to_string(),
                    strength: 0.5,
                    confidence: 0.5,
                }],
                None,
            )
            .await
            .unwrap();

        let a = store.find_by_alias("A").await.unwrap().unwrap();

        let depth1 = store.get_entity_network(&a, 1).await.unwrap();
        assert_eq!(depth1.nodes.len(), 2);
        assert_eq!(depth1.edges.len(), 1);

        let depth2 = store.get_entity_network(&a, 2).await.unwrap();
        assert_eq!(depth2.nodes.len(), 3);
        assert_eq!(depth2.edges.len(), 2);
    }

    #[tokio::test]
    async fn cyclic_relations_terminate() {
        let store = store().await;
        for (src, dst, unit) in [("X", "Y", "iu_1"), ("Y", "X", "iu_2")] {
            store
                .process_extracted(
                    unit,
                    &[],
                    &[ExtractedRelation {
                        source: src.to_string(),
                        target: dst.to_string(),
                        relation_type: "competitor".to_string(),
                        strength: 0.5,
                        confidence: 0.5,
                    }],
                    None,
                )
                .await
                .unwrap();
        }

        let x = store.find_by_alias("X").await.unwrap().unwrap();
        let network = store.get_entity_network(&x, 5).await.unwrap();
        assert_eq!(network.nodes.len(), 2);
        assert_eq!(network.edges.len(), 2);
    }
}
