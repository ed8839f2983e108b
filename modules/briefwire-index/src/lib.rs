//! Text similarity index used for deduplication and the Librarian's
//! retrieval step.
//!
//! The [`VectorIndex`] trait is the seam; any backend returning hits in
//! descending score order with scores in [-1, 1] is acceptable. The bundled
//! [`HashedIndex`] is a dependency-free hashed-feature backend tuned for
//! dedup quality, not search quality.

mod hashed;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use hashed::HashedIndex;

/// One search hit: cosine-style score, higher is closer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub id: String,
    pub score: f64,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Index (or re-index) a document.
    async fn add(&self, id: &str, title: &str, content: &str, metadata: serde_json::Value)
        -> Result<()>;

    /// Nearest neighbors of `query`, best first.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Hit>>;

    /// Most recently indexed ids, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<String>>;

    async fn clear(&self) -> Result<()>;
}
