//! Semantic response cache: exact key first, embedding similarity second
//!
//! Lookups normalize the prompt, try an exact SHA-256 key, then fall back to
//! a vector-store query with the project's similarity threshold. Every
//! external failure (embedding service, vector backend) degrades to a miss;
//! the cache never fails a request.

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::sanitize::Sanitizer;
use crate::vector_store::{VectorRecord, VectorStore};

/// Lower and upper bounds for a project's similarity threshold.
pub const MIN_THRESHOLD: f32 = 0.80;
pub const MAX_THRESHOLD: f32 = 0.99;

/// How a response was served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDecision {
    Miss,
    Exact,
    Semantic,
}

impl CacheDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Miss => "miss",
            Self::Exact => "exact",
            Self::Semantic => "semantic",
        }
    }
}

/// Cached response body plus the token counts it was produced with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedPayload {
    pub response: serde_json::Value,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Result of a cache lookup.
#[derive(Clone, Debug)]
pub enum CacheOutcome {
    Miss,
    Hit {
        payload: CachedPayload,
        similarity: f32,
        decision: CacheDecision,
    },
}

pub fn clamp_threshold(threshold: f32) -> f32 {
    threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}

/// Trim and collapse internal whitespace so formatting differences share a
/// cache entry.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct SemanticCache {
    exact: Cache<String, CachedPayload>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    sanitizer: Sanitizer,
    truncate_len: usize,
}

impl SemanticCache {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        exact_capacity: u64,
        exact_ttl: Duration,
        truncate_len: usize,
    ) -> Self {
        let exact = Cache::builder()
            .max_capacity(exact_capacity)
            .time_to_live(exact_ttl)
            .build();
        Self {
            exact,
            embedder,
            vectors,
            sanitizer: Sanitizer::new(truncate_len),
            truncate_len,
        }
    }

    fn exact_key(project_id: &str, model: &str, normalized_prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(project_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(model.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(normalized_prompt.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Cut over-long prompts before embedding, per the sanitizer policy.
    fn embedding_input(&self, normalized_prompt: &str) -> String {
        if normalized_prompt.chars().count() <= self.truncate_len {
            return normalized_prompt.to_string();
        }
        self.sanitizer.truncate(normalized_prompt).0
    }

    pub async fn lookup(
        &self,
        project_id: &str,
        kind: &str,
        model: &str,
        prompt: &str,
        threshold: f32,
    ) -> CacheOutcome {
        let normalized = normalize_prompt(prompt);
        if normalized.is_empty() {
            return CacheOutcome::Miss;
        }

        let key = Self::exact_key(project_id, model, &normalized);
        if let Some(payload) = self.exact.get(&key).await {
            debug!(project_id, model, "exact cache hit");
            return CacheOutcome::Hit {
                payload,
                similarity: 1.0,
                decision: CacheDecision::Exact,
            };
        }

        let embedding = match self.embedder.embed(&self.embedding_input(&normalized)).await {
            Ok(v) => v,
            Err(err) => {
                warn!(project_id, error = %err, "embedding failed, treating as cache miss");
                return CacheOutcome::Miss;
            }
        };

        let threshold = clamp_threshold(threshold);
        match self
            .vectors
            .query(project_id, kind, &embedding, threshold, 1)
            .await
        {
            Ok(hits) => match hits.into_iter().next() {
                Some(hit) => {
                    debug!(project_id, model, similarity = hit.similarity, "semantic cache hit");
                    match serde_json::from_value::<CachedPayload>(hit.record.payload) {
                        Ok(payload) => CacheOutcome::Hit {
                            payload,
                            similarity: hit.similarity,
                            decision: CacheDecision::Semantic,
                        },
                        Err(err) => {
                            warn!(project_id, error = %err, "undecodable cache payload, miss");
                            CacheOutcome::Miss
                        }
                    }
                }
                None => CacheOutcome::Miss,
            },
            Err(err) => {
                warn!(project_id, error = %err, "vector query failed, treating as cache miss");
                CacheOutcome::Miss
            }
        }
    }

    /// Populate both the exact-key entry and the embedding entry. Safe under
    /// concurrent identical inserts; failures are logged and swallowed.
    pub async fn store(
        &self,
        project_id: &str,
        kind: &str,
        model: &str,
        prompt: &str,
        payload: CachedPayload,
    ) {
        let normalized = normalize_prompt(prompt);
        if normalized.is_empty() {
            return;
        }

        let key = Self::exact_key(project_id, model, &normalized);
        self.exact.insert(key, payload.clone()).await;

        let embedding = match self.embedder.embed(&self.embedding_input(&normalized)).await {
            Ok(v) => v,
            Err(err) => {
                warn!(project_id, error = %err, "embedding failed, skipping vector upsert");
                return;
            }
        };

        let record = VectorRecord {
            project_id: project_id.to_string(),
            kind: kind.to_string(),
            embedding,
            payload: match serde_json::to_value(&payload) {
                Ok(v) => v,
                Err(err) => {
                    warn!(project_id, error = %err, "unencodable cache payload, skipping");
                    return;
                }
            },
            model: model.to_string(),
            tokens_in: payload.tokens_in,
            tokens_out: payload.tokens_out,
            created_at: chrono::Utc::now(),
        };

        if let Err(err) = self.vectors.upsert(record).await {
            warn!(project_id, error = %err, "vector upsert failed");
        }
    }
}
