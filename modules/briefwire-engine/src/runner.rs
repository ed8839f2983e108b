use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use briefwire_agents::Curator;
use briefwire_archive::ArticleStore;
use briefwire_common::{Article, BriefwireError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::digest::{DigestBuilder, DigestTotals};
use crate::notifier::Notifier;
use crate::orchestrator::Orchestrator;
use briefwire_scout::{Fetcher, FeedRegistry};

/// Coerces a closure to a higher-ranked `Fn` so it satisfies the HRTB that
/// `StreamExt::map` + `buffer_unordered` require; without this, rustc infers
/// a closure tied to one concrete lifetime and rejects it ("implementation
/// of `FnOnce` is not general enough").
fn hrtb<T: ?Sized, R, F>(f: F) -> F
where
    F: for<'a> Fn(&'a T) -> Pin<Box<dyn Future<Output = R> + Send + 'a>>,
{
    f
}

/// Counters from the most recent cycle, surfaced by the status endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleStats {
    pub fetched: u64,
    pub new_articles: u64,
    pub analyzed: u64,
    pub units_emitted: u64,
    pub failed: u64,
}

#[derive(Default)]
struct RunState {
    running: bool,
    last_stats: CycleStats,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub max_concurrent_analyses: usize,
    /// Run the legacy article-centric pipeline instead of the
    /// information-centric one.
    pub article_centric: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_analyses: 5,
            article_centric: false,
        }
    }
}

/// Drives fetch → analyze → persist cycles and digest emission. One-shot
/// triggers (admin or CLI) are guarded so only one cycle runs at a time.
pub struct Runner {
    registry: Arc<FeedRegistry>,
    fetcher: Fetcher,
    articles: ArticleStore,
    orchestrator: Arc<Orchestrator>,
    digest_builder: DigestBuilder,
    curator: Curator,
    notifier: Option<Notifier>,
    settings: RunnerSettings,
    state: Mutex<RunState>,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FeedRegistry>,
        fetcher: Fetcher,
        articles: ArticleStore,
        orchestrator: Arc<Orchestrator>,
        digest_builder: DigestBuilder,
        curator: Curator,
        notifier: Option<Notifier>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            registry,
            fetcher,
            articles,
            orchestrator,
            digest_builder,
            curator,
            notifier,
            settings,
            state: Mutex::new(RunState::default()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn last_stats(&self) -> CycleStats {
        self.state.lock().await.last_stats
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    /// Run one fetch-and-analyze cycle. Rejects if a cycle is already in
    /// flight; the check-then-set sits under one lock.
    pub async fn run_cycle(&self, limit: Option<usize>) -> Result<CycleStats, BriefwireError> {
        {
            let mut state = self.state.lock().await;
            if state.running {
                return Err(BriefwireError::AlreadyRunning);
            }
            state.running = true;
        }

        let result = self.run_cycle_inner(limit).await;

        let mut state = self.state.lock().await;
        state.running = false;
        match &result {
            Ok(stats) => {
                state.last_stats = *stats;
                state.last_error = None;
            }
            Err(e) => state.last_error = Some(e.to_string()),
        }
        result.map_err(Into::into)
    }

    async fn run_cycle_inner(&self, limit: Option<usize>) -> Result<CycleStats> {
        let mut stats = CycleStats::default();

        let feeds = self.registry.enabled().await;
        let fetched = self.fetcher.fetch_all(&feeds).await;
        stats.fetched = fetched.len() as u64;

        // Only articles the store has never seen get analyzed.
        let mut fresh: Vec<Article> = Vec::new();
        for article in fetched {
            if !self.articles.exists(&article.url).await? {
                fresh.push(article);
            }
        }
        if let Some(limit) = limit {
            fresh.truncate(limit);
        }
        stats.new_articles = fresh.len() as u64;
        info!(new_articles = fresh.len(), "Starting analysis");

        for article in &fresh {
            self.articles.upsert(article).await?;
        }

        // Fan out across articles; each article's candidate loop stays
        // sequential inside process_article.
        let article_centric = self.settings.article_centric;
        let outcomes: Vec<Result<usize>> = stream::iter(fresh.iter())
            .map(hrtb(move |article: &Article| Box::pin(self.analyze_one(article, article_centric)) as Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>>))
            .buffer_unordered(self.settings.max_concurrent_analyses.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(count) => {
                    stats.analyzed += 1;
                    stats.units_emitted += count as u64;
                }
                Err(e) => {
                    warn!(error = %e, "Article analysis failed");
                    stats.failed += 1;
                }
            }
        }

        // Sweep any units the entity write path missed.
        if let Err(e) = self.orchestrator.backfill_entities(100).await {
            warn!(error = %e, "Entity backfill sweep failed");
        }

        info!(
            fetched = stats.fetched,
            new = stats.new_articles,
            analyzed = stats.analyzed,
            units = stats.units_emitted,
            failed = stats.failed,
            "Cycle complete"
        );
        Ok(stats)
    }

    async fn analyze_one(&self, article: &Article, article_centric: bool) -> Result<usize> {
        if article_centric {
            let enriched = self
                .orchestrator
                .analyze_article(article, self.orchestrator.mode())
                .await;
            self.articles
                .record_analysis(
                    &article.url,
                    enriched.overall_score,
                    &enriched.core_summary,
                    &enriched.tags,
                    &serde_json::to_value(&enriched)?,
                )
                .await?;
            Ok(0)
        } else {
            let units = self.orchestrator.process_article(article).await?;
            Ok(units.len())
        }
    }

    /// Build and (unless `dry_run`) deliver a digest, marking delivered
    /// units sent only after at least one recipient got it.
    pub async fn run_digest(&self, dry_run: bool) -> Result<bool, BriefwireError> {
        {
            let mut state = self.state.lock().await;
            if state.running {
                return Err(BriefwireError::AlreadyRunning);
            }
            state.running = true;
        }

        let result = self.run_digest_inner(dry_run).await;

        let mut state = self.state.lock().await;
        state.running = false;
        if let Err(e) = &result {
            state.last_error = Some(format!("{e:#}"));
        }
        result.map_err(Into::into)
    }

    async fn run_digest_inner(&self, dry_run: bool) -> Result<bool> {
        let stats = self.last_stats().await;
        let totals = DigestTotals {
            fetched: stats.fetched,
            analyzed: stats.analyzed,
            filtered: stats.fetched.saturating_sub(stats.analyzed),
        };

        let digest = self.digest_builder.build(&self.curator, totals).await?;
        if digest.is_empty() {
            info!("Nothing to send, skipping digest");
            return Ok(false);
        }

        if dry_run {
            info!(
                top_picks = digest.top_picks.len(),
                quick_reads = digest.quick_reads.len(),
                "Dry run, digest rendered but not sent"
            );
            return Ok(true);
        }

        let Some(notifier) = &self.notifier else {
            warn!("No notifier configured, digest not sent");
            return Ok(false);
        };

        let sent = notifier.send_digest(&digest, None).await?;
        if sent {
            self.digest_builder.mark_delivered(&digest).await?;
            info!(units = digest.delivered_ids().len(), "Digest delivered and marked sent");
        } else {
            warn!("Digest delivery failed for every recipient, units stay unsent");
        }
        Ok(sent)
    }
}
