//! Embedding store with cosine k-NN queries scoped by (project, kind)
//!
//! The deployed backend is an external pgvector table
//! (`semantic_cache_pgvector`, HNSW index with the cosine operator); inside
//! the gateway the store is a trait so the cache logic stays independent of
//! the backend. `MemoryVectorStore` keeps entries in process and scans,
//! `NullVectorStore` stands in when the backend is disabled and always
//! returns nothing. Callers must tolerate either.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One stored embedding with its cached payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorRecord {
    pub project_id: String,
    /// Cache partition, e.g. "chat" or "completion".
    pub kind: String,
    pub embedding: Vec<f32>,
    pub payload: serde_json::Value,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub created_at: DateTime<Utc>,
}

/// Query result ordered by descending similarity.
#[derive(Clone, Debug)]
pub struct VectorHit {
    pub record: VectorRecord,
    /// `1 - cosine_distance`, in [-1, 1].
    pub similarity: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, record: VectorRecord) -> anyhow::Result<()>;

    async fn upsert_batch(&self, records: Vec<VectorRecord>) -> anyhow::Result<()> {
        for record in records {
            self.upsert(record).await?;
        }
        Ok(())
    }

    /// Return up to `limit` entries of `(project_id, kind)` with cosine
    /// similarity at or above `threshold`, best first. Entries of other
    /// projects are never returned.
    async fn query(
        &self,
        project_id: &str,
        kind: &str,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> anyhow::Result<Vec<VectorHit>>;
}

/// In-process store backed by a scan. Read-consistent with the caller's own
/// upserts.
#[derive(Default)]
pub struct MemoryVectorStore {
    entries: RwLock<Vec<VectorRecord>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, record: VectorRecord) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        entries.push(record);
        Ok(())
    }

    async fn query(
        &self,
        project_id: &str,
        kind: &str,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> anyhow::Result<Vec<VectorHit>> {
        let entries = self.entries.read().await;

        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|e| e.project_id == project_id && e.kind == kind)
            .filter(|e| e.embedding.len() == embedding.len())
            .map(|e| VectorHit {
                similarity: cosine_similarity(embedding, &e.embedding),
                record: e.clone(),
            })
            .filter(|hit| hit.similarity >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Store used when the vector backend is disabled. Upserts are discarded and
/// queries come back empty, degrading the semantic cache to always-miss.
pub struct NullVectorStore;

#[async_trait]
impl VectorStore for NullVectorStore {
    async fn upsert(&self, _record: VectorRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn query(
        &self,
        _project_id: &str,
        _kind: &str,
        _embedding: &[f32],
        _threshold: f32,
        _limit: usize,
    ) -> anyhow::Result<Vec<VectorHit>> {
        Ok(Vec::new())
    }
}

/// Cosine similarity with a zero-magnitude guard.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}
