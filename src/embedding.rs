//! Embedding service clients for the semantic cache
//!
//! The cache treats embeddings as best-effort: any failure here degrades a
//! lookup to a miss, it never fails the request.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Remote embedding endpoint speaking the OpenAI embeddings shape.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, url: String, api_key: Option<String>, model: String) -> Self {
        Self { client, url, api_key, model }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "model": self.model, "input": text }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("embedding service returned {}", status);
        }

        let body: EmbeddingResponse = response.json().await?;
        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("embedding service returned no data"))
    }
}

/// Deterministic local embedder used when no embedding service is
/// configured. Token hashes are folded into a fixed-size bag-of-words
/// vector, which is enough for exact and near-exact prompts to land close
/// together.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(word.as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"))
                as usize
                % self.dimensions;
            vector[bucket] += 1.0;
        }
        Ok(vector)
    }
}

/// Embedder returning pre-seeded vectors, for tests that need exact
/// similarities. Unknown texts fall back to the default vector or fail.
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fallback: Option<Vec<f32>>,
}

impl FixedEmbedder {
    pub fn new() -> Self {
        Self { vectors: HashMap::new(), fallback: None }
    }

    pub fn with_fallback(mut self, vector: Vec<f32>) -> Self {
        self.fallback = Some(vector);
        self
    }

    pub fn insert(&mut self, text: impl Into<String>, vector: Vec<f32>) {
        self.vectors.insert(text.into(), vector);
    }
}

impl Default for FixedEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.vectors
            .get(text)
            .cloned()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow::anyhow!("no fixed embedding for input"))
    }
}
