use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ai_client::{with_session, Gateway};
use anyhow::Result;
use briefwire_agents::{
    Analyst, AnalystKind, AnalysisContext, Collector, Editor, Extractor, Librarian, Merger,
};
use briefwire_archive::InformationStore;
use briefwire_common::{
    AnalysisMode, Article, EnrichedArticle, ExtractedEntity, InformationUnit,
};
use briefwire_graph::EntityStore;
use briefwire_index::VectorIndex;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::{info, warn};
use uuid::Uuid;

/// Similarity floor for treating two units as the same story.
const SEMANTIC_DEDUP_THRESHOLD: f64 = 0.6;
const SEMANTIC_DEDUP_TOP_K: usize = 3;

/// Dispatches agents per analysis mode and runs the information-centric
/// pipeline: extract, dedup (exact then semantic), merge, persist, and feed
/// the knowledge graph.
pub struct Orchestrator {
    collector: Collector,
    librarian: Librarian,
    analysts: Vec<Analyst>,
    editor: Editor,
    extractor: Extractor,
    index: Arc<dyn VectorIndex>,
    units: InformationStore,
    entities: Option<EntityStore>,
    mode: AnalysisMode,
    audit_dir: Option<PathBuf>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<Gateway>,
        index: Arc<dyn VectorIndex>,
        units: InformationStore,
        entities: Option<EntityStore>,
        mode: AnalysisMode,
        l3_roots: Vec<String>,
        audit_dir: Option<PathBuf>,
    ) -> Self {
        let analysts = AnalystKind::all()
            .into_iter()
            .map(|kind| Analyst::new(kind, gateway.clone()))
            .collect();
        Self {
            collector: Collector::new(gateway.clone()),
            librarian: Librarian::new(gateway.clone(), index.clone()),
            analysts,
            editor: Editor::new(gateway.clone()),
            extractor: Extractor::new(gateway, l3_roots),
            index,
            units,
            entities,
            mode,
            audit_dir,
        }
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    // --- Legacy article-centric path ---

    /// QUICK: Collector only. STANDARD: + Librarian. DEEP: + parallel
    /// analysts. Any degradation yields a trivial enrichment, never an
    /// error.
    pub async fn analyze_article(&self, article: &Article, mode: AnalysisMode) -> EnrichedArticle {
        // Sessions for this path are keyed on the article URL so all of one
        // article's calls group together in telemetry.
        let session_id = format!("article:{}", article.url);
        let article = article.clone();
        with_session(session_id, async move {
            let mut context = AnalysisContext::new(article.clone(), mode);

            let collected = self.collector.process(&article, &mut context).await;
            context.push_trace(collected.trace.clone());

            if matches!(mode, AnalysisMode::Standard | AnalysisMode::Deep) {
                let librarian = self.librarian.process(&article, &mut context).await;
                context.push_trace(librarian.trace.clone());
            }

            if mode == AnalysisMode::Deep {
                self.run_analysts(&mut context).await;
            }

            let edited = self.editor.process(&context).await;
            context.push_trace(edited.trace.clone());
            let mut enriched = edited.data;
            enriched.traces = context.traces.clone();

            // Index the article so future analyses can retrieve it.
            if let Err(e) = self
                .index
                .add(
                    &article.url,
                    &article.title,
                    context.analysis_text(),
                    serde_json::json!({ "title": article.title, "url": article.url }),
                )
                .await
            {
                warn!(url = article.url, error = %e, "Failed to index article");
            }

            self.write_audit(&article, &enriched);
            enriched
        })
        .await
    }

    /// Launch the three analysts concurrently; a failed analyst leaves an
    /// empty report in its slot.
    async fn run_analysts(&self, context: &mut AnalysisContext) {
        let (a, b, c) = tokio::join!(
            self.analysts[0].process(context),
            self.analysts[1].process(context),
            self.analysts[2].process(context),
        );

        for (analyst, output) in self.analysts.iter().zip([a, b, c]) {
            context
                .analyst_reports
                .insert(analyst.name().to_string(), output.data.clone());
            context.push_trace(output.trace);
        }
    }

    // --- Information-centric path ---

    /// Decompose one article into information units, deduplicating against
    /// the store and feeding the entity graph. Candidates are processed
    /// strictly in order: a later candidate may match one just persisted.
    pub async fn process_article(&self, article: &Article) -> Result<Vec<InformationUnit>> {
        let session_id = format!("unit:{}", Uuid::new_v4().simple());
        let article = article.clone();
        with_session(session_id, async move {
            let analyst_reports = if self.mode == AnalysisMode::Deep {
                let mut context = AnalysisContext::new(article.clone(), self.mode);
                self.run_analysts(&mut context).await;
                context.analyst_reports
            } else {
                HashMap::new()
            };

            let extraction = self.extractor.process(&article, &analyst_reports).await;
            if !extraction.success {
                warn!(url = article.url, "Extraction failed, no units for article");
                return Ok(Vec::new());
            }
            let output = extraction.data;

            let mut emitted = Vec::with_capacity(output.units.len());
            for candidate in output.units {
                let unit = self.dedup_and_persist(candidate).await?;

                if let Some(entity_store) = &self.entities {
                    let event_time = unit.event_time.as_deref().and_then(parse_event_time);
                    if let Err(e) = entity_store
                        .process_extracted(&unit.id, &output.entities, &output.relations, event_time)
                        .await
                    {
                        warn!(unit = unit.id, error = %e, "Entity write path failed");
                    }
                }
                // Set unconditionally, zero-entity extractions included, so
                // the backfill sweep terminates.
                self.units.mark_entity_processed(&unit.id).await?;

                emitted.push(unit);
            }

            info!(url = article.url, units = emitted.len(), "Article processed");
            Ok(emitted)
        })
        .await
    }

    /// Dedup one candidate: exact fingerprint match first, semantic second,
    /// novel last. The surviving unit is persisted and indexed.
    async fn dedup_and_persist(&self, candidate: InformationUnit) -> Result<InformationUnit> {
        // Exact fingerprint hit: merge into the existing identity.
        if let Some(existing) = self.units.get_by_fingerprint(&candidate.fingerprint).await? {
            info!(unit = existing.id, "Exact duplicate, merging");
            let merged = Merger::merge(existing, &[candidate]);
            self.units.save(&merged).await?;
            self.units.index_unit(&merged).await?;
            return Ok(merged);
        }

        // Semantic near-duplicates: merge into the best match's identity.
        let similar = self
            .units
            .find_similar(&candidate, SEMANTIC_DEDUP_THRESHOLD, SEMANTIC_DEDUP_TOP_K)
            .await?;
        if !similar.is_empty() {
            let (survivor, score) = (similar[0].0.clone(), similar[0].1);
            info!(unit = survivor.id, score, "Semantic duplicate, merging");
            let rest: Vec<InformationUnit> = similar
                .into_iter()
                .skip(1)
                .map(|(u, _)| u)
                .chain(std::iter::once(candidate))
                .collect();
            let merged = Merger::merge(survivor, &rest);
            self.units.save(&merged).await?;
            self.units.index_unit(&merged).await?;
            return Ok(merged);
        }

        // Novel unit.
        self.units.save(&candidate).await?;
        self.units.index_unit(&candidate).await?;
        Ok(candidate)
    }

    /// Backfill sweep over units the entity write path never saw. Anchors
    /// stand in for the original extraction. Every swept unit gets its flag
    /// set, zero-anchor units included, so the sweep converges; units that
    /// fail the graph write stay pending for the next sweep.
    pub async fn backfill_entities(&self, limit: i64) -> Result<u64> {
        let Some(entity_store) = &self.entities else {
            return Ok(0);
        };

        let pending = self.units.get_unprocessed_entities(limit).await?;
        let mut swept = 0u64;
        for unit in pending {
            let entities: Vec<ExtractedEntity> = unit
                .entity_anchors
                .iter()
                .filter(|a| !a.l1_name.trim().is_empty())
                .map(|a| ExtractedEntity {
                    name: a.l1_name.clone(),
                    l3_root: a.l3_root.clone(),
                    l2_sector: a.l2_sector.clone(),
                    role: a.l1_role.clone(),
                    ..Default::default()
                })
                .collect();

            let event_time = unit.event_time.as_deref().and_then(parse_event_time);
            if let Err(e) = entity_store
                .process_extracted(&unit.id, &entities, &[], event_time)
                .await
            {
                warn!(unit = unit.id, error = %e, "Backfill entity write failed");
                continue;
            }
            self.units.mark_entity_processed(&unit.id).await?;
            swept += 1;
        }

        if swept > 0 {
            info!(swept, "Entity backfill sweep complete");
        }
        Ok(swept)
    }

    /// Audit record for one analysis: traces plus the final result, under
    /// the data dir. Failures are logged and dropped.
    fn write_audit(&self, article: &Article, enriched: &EnrichedArticle) {
        let Some(dir) = &self.audit_dir else { return };
        let result = (|| -> Result<()> {
            std::fs::create_dir_all(dir)?;
            let name = format!(
                "{}-{}.json",
                Utc::now().format("%Y%m%dT%H%M%S"),
                briefwire_common::unit_fingerprint(&article.url, "")
                    .chars()
                    .take(12)
                    .collect::<String>()
            );
            let payload = serde_json::json!({
                "url": article.url,
                "analyzed_at": Utc::now(),
                "overall_score": enriched.overall_score,
                "result": enriched,
            });
            std::fs::write(dir.join(name), serde_json::to_string_pretty(&payload)?)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(url = article.url, error = %e, "Failed to write analysis audit");
        }
    }
}

/// Best-effort event-time parse for the entity write path.
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
