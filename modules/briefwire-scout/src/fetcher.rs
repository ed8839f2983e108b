use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use briefwire_common::Article;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::readability::extract_main_content;
use crate::registry::FeedEntry;

const FEED_TIMEOUT_SECS: u64 = 30;
const EXTRACT_TIMEOUT_SECS: u64 = 15;
/// Feed entries with at least this much content skip full-text extraction.
const EXTRACTION_CONTENT_FLOOR: usize = 500;
const USER_AGENT: &str = "briefwire/0.1";

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

#[derive(Debug, Clone, Copy)]
pub struct FetcherSettings {
    pub max_concurrent_fetches: usize,
    pub max_concurrent_extractions: usize,
    pub retention_days: i64,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 10,
            max_concurrent_extractions: 5,
            retention_days: 180,
        }
    }
}

/// Concurrent feed fetcher. Stateless; the caller filters results against
/// the article store.
pub struct Fetcher {
    settings: FetcherSettings,
    feed_http: reqwest::Client,
    page_http: reqwest::Client,
}

impl Fetcher {
    pub fn new(settings: FetcherSettings) -> Self {
        let feed_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(FEED_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to build feed HTTP client");
        let page_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(EXTRACT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to build page HTTP client");
        Self {
            settings,
            feed_http,
            page_http,
        }
    }

    /// Fetch every enabled feed, map entries to articles inside the
    /// retention window, optionally enrich thin entries with full-page
    /// text, and deduplicate by URL (first seen wins).
    ///
    /// A failing feed contributes zero articles and a warning; other feeds
    /// are unaffected. No inline HTTP retries: the next scheduler firing is
    /// the retry.
    pub async fn fetch_all(&self, feeds: &[FeedEntry]) -> Vec<Article> {
        let now = Utc::now();
        let enabled: Vec<&FeedEntry> = feeds.iter().filter(|f| f.enabled).collect();
        info!(feeds = enabled.len(), "Starting feed fetch");

        let per_feed: Vec<Vec<Article>> = stream::iter(enabled.iter())
            .map(hrtb(move |feed: &&FeedEntry| Box::pin(self.fetch_feed_or_warn(feed, now)) as Pin<Box<dyn Future<Output = Vec<Article>> + Send + '_>>))
            .buffer_unordered(self.settings.max_concurrent_fetches.max(1))
            .collect()
            .await;

        let articles: Vec<Article> = per_feed.into_iter().flatten().collect();
        info!(articles = articles.len(), "Feeds fetched");

        let articles = self.extract_pass(articles).await;

        // Dedup by URL, first seen wins.
        let mut seen = HashSet::new();
        let deduped: Vec<Article> = articles
            .into_iter()
            .filter(|a| seen.insert(a.url.clone()))
            .collect();

        info!(articles = deduped.len(), "Fetch cycle complete");
        deduped
    }

    async fn fetch_feed_or_warn(&self, feed: &FeedEntry, now: DateTime<Utc>) -> Vec<Article> {
        match self.fetch_feed(feed, now).await {
            Ok(articles) => articles,
            Err(e) => {
                warn!(feed = feed.name, url = feed.url, error = %e, "Feed fetch failed");
                Vec::new()
            }
        }
    }

    async fn fetch_feed(&self, feed: &FeedEntry, now: DateTime<Utc>) -> Result<Vec<Article>> {
        let response = self
            .feed_http
            .get(&feed.url)
            .send()
            .await
            .context("feed request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("feed returned {}", response.status());
        }
        let bytes = response.bytes().await.context("feed body read failed")?;

        parse_feed(&bytes, feed, now, self.settings.retention_days)
    }

    /// Full-text extraction for thin entries, on a bounded pool. The HTML
    /// scan is CPU-bound, so it runs on a blocking worker. Failures fall
    /// back to the feed-provided content silently.
    async fn extract_pass(&self, articles: Vec<Article>) -> Vec<Article> {
        stream::iter(articles.into_iter())
            .map(|article| self.extract_one(article))
            .buffer_unordered(self.settings.max_concurrent_extractions.max(1))
            .collect()
            .await
    }

    async fn extract_one(&self, mut article: Article) -> Article {
        if article.content.len() > EXTRACTION_CONTENT_FLOOR {
            return article;
        }
        match self.extract_page(&article.url).await {
            Ok(text) if !text.is_empty() => {
                article.extracted_content = Some(text);
                article
            }
            Ok(_) | Err(_) => article,
        }
    }

    async fn extract_page(&self, url: &str) -> Result<String> {
        let response = self.page_http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("page returned {}", response.status());
        }
        let html = response.text().await?;
        let text = tokio::task::spawn_blocking(move || extract_main_content(&html))
            .await
            .context("extraction worker panicked")?;
        Ok(text)
    }
}

/// Map a feed body to articles. Pure; `now` is injected for retention.
pub fn parse_feed(
    bytes: &[u8],
    feed: &FeedEntry,
    now: DateTime<Utc>,
    retention_days: i64,
) -> Result<Vec<Article>> {
    let parsed = feed_rs::parser::parse(bytes).context("feed parse failed")?;
    let cutoff = now - chrono::Duration::days(retention_days);

    let articles = parsed
        .entries
        .into_iter()
        .filter_map(|entry| map_entry(entry, feed, now, cutoff))
        .collect();
    Ok(articles)
}

/// Entry → Article. Drops entries without URL or title, and entries whose
/// publish time falls strictly before the retention cutoff. An entry at
/// exactly the cutoff is kept.
fn map_entry(
    entry: feed_rs::model::Entry,
    feed: &FeedEntry,
    now: DateTime<Utc>,
    cutoff: DateTime<Utc>,
) -> Option<Article> {
    let url = entry
        .links
        .first()
        .map(|l| l.href.clone())
        .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;

    let title = entry.title.as_ref().map(|t| t.content.trim().to_string())?;
    if title.is_empty() {
        return None;
    }

    let published_at = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.with_timezone(&Utc));

    if let Some(published) = published_at {
        if published < cutoff {
            return None;
        }
    }

    let summary = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .unwrap_or_default();
    let content = entry
        .content
        .and_then(|c| c.body)
        .unwrap_or_else(|| summary.clone());

    let author = entry.authors.first().map(|a| a.name.clone());

    Some(Article {
        url,
        title,
        content,
        extracted_content: None,
        summary,
        source_name: feed.name.clone(),
        category: feed.category.clone(),
        author,
        published_at,
        fetched_at: now,
        sent_at: None,
    })
}
