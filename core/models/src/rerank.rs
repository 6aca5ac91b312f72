use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

/// Joint scoring of (query, candidate) pairs. Output order matches
/// candidate order; higher is more relevant. Must be deterministic for
/// a fixed model.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    async fn score_batch(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

// ============================================================================
// Lexical fallback encoder
// ============================================================================

/// Deterministic overlap scorer standing in for the MiniLM-class
/// cross-encoder in tests and offline setups. Scores are normalised
/// token overlap with crude plural folding.
#[derive(Debug, Default, Clone)]
pub struct LexicalCrossEncoder;

impl LexicalCrossEncoder {
    pub fn new() -> Self {
        Self
    }

    fn score_one(query_tokens: &HashSet<String>, candidate: &str) -> f32 {
        let candidate_tokens = fold_tokens(candidate);
        if query_tokens.is_empty() || candidate_tokens.is_empty() {
            return 0.0;
        }
        let overlap = candidate_tokens.intersection(query_tokens).count() as f32;
        overlap / ((query_tokens.len() as f32) * (candidate_tokens.len() as f32)).sqrt()
    }
}

fn fold_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.strip_suffix('s').filter(|s| s.len() > 2).unwrap_or(t).to_string())
        .collect()
}

#[async_trait]
impl CrossEncoder for LexicalCrossEncoder {
    async fn score_batch(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let query_tokens = fold_tokens(query);
        Ok(candidates
            .iter()
            .map(|c| Self::score_one(&query_tokens, c))
            .collect())
    }
}

// ============================================================================
// HTTP cross-encoder
// ============================================================================

/// Client for a text-embeddings-inference style `/rerank` endpoint.
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RerankItem {
    index: usize,
    score: f32,
}

impl HttpCrossEncoder {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reranker HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("RERANKER_URL").unwrap_or_else(|_| "http://localhost:8082".to_string());
        Self::new(base_url, Duration::from_secs(2))
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    async fn score_batch(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/rerank", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "query": query, "texts": candidates }))
            .send()
            .await
            .context("failed to call rerank endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("rerank endpoint error {}: {}", status, error_text);
        }

        let items: Vec<RerankItem> = response
            .json()
            .await
            .context("failed to parse rerank response")?;

        // The endpoint returns items sorted by score; restore input order.
        let mut scores = vec![0.0f32; candidates.len()];
        for item in items {
            if item.index < scores.len() {
                scores[item.index] = item.score;
            }
        }
        Ok(scores)
    }
}
