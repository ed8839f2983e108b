use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Hit, VectorIndex};

const DIM: usize = 256;
const MAX_WORD_TOKENS: usize = 200;
/// Search scans only this many most-recent vectors to bound cost.
const SCAN_WINDOW: usize = 100;

/// Hashed-feature embedding backend.
///
/// Features are lowercase word tokens plus character 2-grams and 3-grams.
/// Each feature hashes to a dimension (hash mod 256) and a sign (from the
/// next hash bit); the accumulated vector is L2-normalized and compared by
/// cosine. Good enough to catch near-duplicate phrasing across sources.
pub struct HashedIndex {
    state: RwLock<Vec<Entry>>,
}

struct Entry {
    id: String,
    vector: [f32; DIM],
    metadata: serde_json::Value,
}

impl HashedIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Vec::new()),
        }
    }

    pub fn embed(text: &str) -> [f32; DIM] {
        let mut vector = [0f32; DIM];
        let lowered = text.to_lowercase();

        for token in lowered.split_whitespace().take(MAX_WORD_TOKENS) {
            accumulate(&mut vector, token.as_bytes());
        }

        let chars: Vec<char> = lowered.chars().collect();
        for n in [2usize, 3] {
            if chars.len() < n {
                continue;
            }
            for window in chars.windows(n) {
                let gram: String = window.iter().collect();
                accumulate(&mut vector, gram.as_bytes());
            }
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashedIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn accumulate(vector: &mut [f32; DIM], feature: &[u8]) {
    let hash = fnv1a(feature);
    let index = (hash % DIM as u64) as usize;
    let sign = if (hash / DIM as u64) % 2 == 0 { 1.0 } else { -1.0 };
    vector[index] += sign;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn l2_normalize(vector: &mut [f32; DIM]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

fn cosine(a: &[f32; DIM], b: &[f32; DIM]) -> f64 {
    // Both sides are unit vectors, so the dot product is the cosine.
    a.iter().zip(b.iter()).map(|(x, y)| (x * y) as f64).sum()
}

#[async_trait]
impl VectorIndex for HashedIndex {
    async fn add(
        &self,
        id: &str,
        title: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let vector = Self::embed(&format!("{title} {content}"));
        let mut state = self.state.write().await;
        // Re-adding an id moves it to the most-recent position.
        state.retain(|e| e.id != id);
        state.push(Entry {
            id: id.to_string(),
            vector,
            metadata,
        });
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Hit>> {
        let query_vector = Self::embed(query);
        let state = self.state.read().await;

        let mut hits: Vec<Hit> = state
            .iter()
            .rev()
            .take(SCAN_WINDOW)
            .map(|entry| Hit {
                id: entry.id.clone(),
                score: cosine(&query_vector, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);

        debug!(query_len = query.len(), hits = hits.len(), "index search");
        Ok(hits)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.iter().rev().take(limit).map(|e| e.id.clone()).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.state.write().await.clear();
        Ok(())
    }
}
