use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use briefwire_common::BriefwireError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

const VALIDATE_TIMEOUT_SECS: u64 = 10;

/// One subscribed feed. Order in the file is preserved across rewrites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FeedsFile {
    #[serde(default)]
    feeds: Vec<FeedEntry>,
}

/// Ordered set of feed descriptors, persisted to a TOML file. Single-writer:
/// every mutation holds the lock across read-modify-write-persist; reads
/// return cloned snapshots.
pub struct FeedRegistry {
    path: PathBuf,
    state: Mutex<Vec<FeedEntry>>,
    http: reqwest::Client,
}

impl FeedRegistry {
    /// Load the registry from `path`. A missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let feeds = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read feeds file: {}", path.display()))?;
            let file: FeedsFile = toml::from_str(&content)
                .with_context(|| format!("Failed to parse feeds file: {}", path.display()))?;
            file.feeds
        } else {
            Vec::new()
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(VALIDATE_TIMEOUT_SECS))
            .build()
            .expect("Failed to build feed validation client");

        Ok(Self {
            path,
            state: Mutex::new(feeds),
            http,
        })
    }

    pub async fn list(&self) -> Vec<FeedEntry> {
        self.state.lock().await.clone()
    }

    pub async fn enabled(&self) -> Vec<FeedEntry> {
        self.state
            .lock()
            .await
            .iter()
            .filter(|f| f.enabled)
            .cloned()
            .collect()
    }

    /// Add a feed. A duplicate URL is rejected.
    pub async fn add(&self, name: &str, url: &str, category: &str) -> Result<(), BriefwireError> {
        let mut state = self.state.lock().await;
        if state.iter().any(|f| f.url == url) {
            return Err(BriefwireError::DuplicateFeed(url.to_string()));
        }
        state.push(FeedEntry {
            name: name.to_string(),
            url: url.to_string(),
            category: category.to_string(),
            enabled: true,
        });
        self.persist(&state)?;
        info!(name, url, "Feed added");
        Ok(())
    }

    /// Remove by exact name or URL (case-sensitive).
    pub async fn remove(&self, ident: &str) -> Result<FeedEntry, BriefwireError> {
        let mut state = self.state.lock().await;
        let position = state
            .iter()
            .position(|f| f.name == ident || f.url == ident)
            .ok_or_else(|| BriefwireError::FeedNotFound(ident.to_string()))?;
        let removed = state.remove(position);
        self.persist(&state)?;
        info!(name = removed.name, url = removed.url, "Feed removed");
        Ok(removed)
    }

    /// Enable or disable by exact name or URL (case-sensitive).
    pub async fn set_enabled(&self, ident: &str, enabled: bool) -> Result<(), BriefwireError> {
        let mut state = self.state.lock().await;
        let feed = state
            .iter_mut()
            .find(|f| f.name == ident || f.url == ident)
            .ok_or_else(|| BriefwireError::FeedNotFound(ident.to_string()))?;
        feed.enabled = enabled;
        let name = feed.name.clone();
        self.persist(&state)?;
        info!(name, enabled, "Feed toggled");
        Ok(())
    }

    /// Probe a URL: one GET with a 10 s timeout, parsed as RSS/Atom.
    /// Pass/fail only; registry state is untouched.
    pub async fn validate(&self, url: &str) -> bool {
        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url, error = %e, "Feed validation fetch failed");
                return false;
            }
        };
        if !response.status().is_success() {
            warn!(url, status = %response.status(), "Feed validation got non-2xx");
            return false;
        }
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(url, error = %e, "Feed validation body read failed");
                return false;
            }
        };
        match feed_rs::parser::parse(&bytes[..]) {
            Ok(_) => true,
            Err(e) => {
                warn!(url, error = %e, "Feed validation parse failed");
                false
            }
        }
    }

    fn persist(&self, feeds: &[FeedEntry]) -> Result<(), BriefwireError> {
        let file = FeedsFile {
            feeds: feeds.to_vec(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| BriefwireError::Storage(format!("feeds serialization: {e}")))?;
        std::fs::write(&self.path, content)
            .map_err(|e| BriefwireError::Storage(format!("feeds write: {e}")))?;
        Ok(())
    }
}
