use anyhow::Result;
use briefwire_agents::{Curation, Curator};
use briefwire_archive::InformationStore;
use briefwire_common::InformationUnit;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::info;

/// How many unsent units one digest window considers.
const DIGEST_CANDIDATE_LIMIT: i64 = 100;
/// How many recently sent items feed history avoidance.
const HISTORY_WINDOW: i64 = 20;

/// Totals shown in the digest footer.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DigestTotals {
    pub fetched: u64,
    pub analyzed: u64,
    pub filtered: u64,
}

/// One rendered-and-deliverable digest window.
#[derive(Debug, Clone, Serialize)]
pub struct Digest {
    pub date: NaiveDate,
    pub daily_summary: String,
    pub top_picks: Vec<InformationUnit>,
    pub quick_reads: Vec<InformationUnit>,
    pub totals: DigestTotals,
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.top_picks.is_empty() && self.quick_reads.is_empty()
    }

    /// Ids of every unit this digest delivers.
    pub fn delivered_ids(&self) -> Vec<String> {
        self.top_picks
            .iter()
            .chain(self.quick_reads.iter())
            .map(|u| u.id.clone())
            .collect()
    }
}

/// Assembles a digest from unsent units via the Curator. Marking units sent
/// is the caller's move, after delivery actually happens.
pub struct DigestBuilder {
    units: InformationStore,
}

impl DigestBuilder {
    pub fn new(units: InformationStore) -> Self {
        Self { units }
    }

    pub async fn build(&self, curator: &Curator, totals: DigestTotals) -> Result<Digest> {
        let candidates = self.units.get_unsent(DIGEST_CANDIDATE_LIMIT).await?;
        let history = self
            .units
            .recent_sent_digest_entries(HISTORY_WINDOW)
            .await?;

        let curated = curator.curate(candidates, &history).await;
        let Curation {
            top_picks,
            quick_reads,
            excluded,
            daily_summary,
        } = curated.data;

        info!(
            top_picks = top_picks.len(),
            quick_reads = quick_reads.len(),
            excluded = excluded.len(),
            "Digest assembled"
        );

        Ok(Digest {
            date: Utc::now().date_naive(),
            daily_summary,
            top_picks,
            quick_reads,
            totals,
        })
    }

    /// Atomically mark every delivered unit sent.
    pub async fn mark_delivered(&self, digest: &Digest) -> Result<()> {
        self.units.mark_sent(&digest.delivered_ids()).await
    }
}
