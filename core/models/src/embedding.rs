use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hindsight_schemas::EMBEDDING_DIM;
use serde::Deserialize;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::warn;

/// Maps text to a 384-dim L2-normalised vector. Batch output order
/// matches input order.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| anyhow!("embedding backend returned an empty batch"))
    }
}

pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

// ============================================================================
// Local feature-hashing embedder
// ============================================================================

/// Deterministic bag-of-words embedder: each token (and a short prefix,
/// so inflected forms land near each other) hashes into one of 384
/// signed buckets. Stands in for the sentence-embedding model in tests
/// and offline setups.
#[derive(Debug, Default, Clone)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub fn new() -> Self {
        Self
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; EMBEDDING_DIM];
        for token in tokenize(text) {
            add_feature(&mut vec, &token);
            if token.chars().count() > 4 {
                let prefix: String = token.chars().take(4).collect();
                add_feature(&mut vec, &prefix);
            }
        }
        l2_normalize(&mut vec);
        vec
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn add_feature(vec: &mut [f32], feature: &str) {
    let mut hasher = DefaultHasher::new();
    feature.hash(&mut hasher);
    let h = hasher.finish();
    let bucket = (h % EMBEDDING_DIM as u64) as usize;
    let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
    vec[bucket] += sign;
}

#[async_trait]
impl EmbeddingClient for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============================================================================
// HTTP embedder
// ============================================================================

/// Client for a text-embeddings-inference style endpoint serving a
/// BGE-small class model. One retry with jitter, then the caller sees
/// the failure as fatal for the request.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct EmbedResponse(Vec<Vec<f32>>);

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("EMBEDDINGS_URL")
            .unwrap_or_else(|_| "http://localhost:8081".to_string());
        Self::new(base_url, Duration::from_secs(2))
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "inputs": texts }))
            .send()
            .await
            .context("failed to call embedding endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("embedding endpoint error {}: {}", status, error_text);
        }

        let EmbedResponse(mut vectors) = response
            .json()
            .await
            .context("failed to parse embedding response")?;

        if vectors.len() != texts.len() {
            anyhow::bail!(
                "embedding endpoint returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            );
        }
        for vec in &mut vectors {
            if vec.len() != EMBEDDING_DIM {
                anyhow::bail!("embedding has {} dims, expected {}", vec.len(), EMBEDDING_DIM);
            }
            l2_normalize(vec);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self.request(texts).await {
            Ok(vectors) => Ok(vectors),
            Err(first) => {
                warn!("embedding call failed, retrying once: {}", first);
                tokio::time::sleep(Duration::from_millis(retry_jitter_ms(texts.len()))).await;
                self.request(texts).await
            }
        }
    }
}

/// Deterministic jitter in [50, 150) ms; no rand crate needed.
pub(crate) fn retry_jitter_ms(seed: usize) -> u64 {
    let x = (seed as u32).wrapping_mul(2654435761);
    50 + (x % 100) as u64
}
