//! Embedding provider abstraction: turns FEN strings (or query text) into
//! vectors, backed by an OpenAI-compatible embeddings endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::AppError;
use crate::retry::{retry_with_backoff, Clock, Outcome, RetryPolicy, TokioClock};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_texts(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::Fatal("embedding provider returned no vector".to_string()))
    }

    fn dims(&self) -> usize;
    fn model_name(&self) -> &str;
}

pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self, AppError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AppError::Validation("EMBEDDING_API_KEY is required".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Fatal(e.to_string()))?;
        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            api_key,
            model: config.model.clone(),
            dims: config.dims,
        })
    }
}

/// Stands in for [`OpenAIEmbeddingProvider`] when `EMBEDDING_PROVIDER=disabled`.
/// Every call fails with [`AppError::Validation`] so callers surface a clear
/// "embeddings disabled" error instead of silently returning empty vectors.
pub struct DisabledEmbeddingProvider {
    dims: usize,
    model: String,
}

impl DisabledEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            model: "disabled".to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for DisabledEmbeddingProvider {
    async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Err(AppError::Validation(
            "embedding provider is disabled (EMBEDDING_PROVIDER=disabled)".to_string(),
        ))
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingItem>,
}

#[derive(Deserialize)]
struct OpenAIEmbeddingItem {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.1,
        };
        let clock = TokioClock;

        let result = retry_with_backoff(
            &policy,
            &clock,
            || call_openai(&self.client, &self.api_base, &self.api_key, &self.model, texts),
            classify_embedding_error,
            |attempt, delay, err| {
                tracing::warn!(attempt, ?delay, error = %err, "retrying embedding call");
            },
        )
        .await?;

        let mut ordered = vec![Vec::new(); texts.len()];
        for item in result.data {
            if item.index < ordered.len() {
                ordered[item.index] = item.embedding;
            }
        }
        Ok(ordered)
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

async fn call_openai(
    client: &reqwest::Client,
    api_base: &str,
    api_key: &str,
    model: &str,
    texts: &[String],
) -> Result<OpenAIEmbeddingResponse, AppError> {
    let resp = client
        .post(format!("{api_base}/embeddings"))
        .bearer_auth(api_key)
        .json(&serde_json::json!({ "model": model, "input": texts }))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(if status.as_u16() == 429 {
            AppError::UpstreamThrottled(body)
        } else if status.is_server_error() {
            AppError::UpstreamUnavailable(body)
        } else {
            AppError::SchemaViolation(format!("embedding request rejected ({status}): {body}"))
        });
    }

    resp.json::<OpenAIEmbeddingResponse>()
        .await
        .map_err(AppError::from)
}

fn classify_embedding_error(e: AppError) -> Outcome<AppError> {
    match e {
        AppError::UpstreamThrottled(_) | AppError::UpstreamUnavailable(_) | AppError::Timeout(_) => {
            Outcome::Retry(e)
        }
        other => Outcome::Fatal(other),
    }
}

/// Splits a batch of FENs into chunks bounded both by count (`chunk_size`)
/// and by total characters (`max_chars`). A single FEN longer than
/// `max_chars` is returned alone in its own chunk.
pub fn chunk_for_embedding<'a>(
    items: &'a [String],
    chunk_size: usize,
    max_chars: usize,
) -> Vec<Vec<&'a str>> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_chars = 0usize;

    for item in items {
        let len = item.len();
        if len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            chunks.push(vec![item.as_str()]);
            continue;
        }
        if current.len() >= chunk_size || current_chars + len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current.push(item.as_str());
        current_chars += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Stable content hash used as the vector store's point id: SHA-256 of the
/// normalised FEN, hex-encoded, truncated to 32 hex characters, prefixed
/// for readability. See `SPEC_FULL.md` Open Questions §2.
pub fn vector_id(fen: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fen.trim().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("fen:{}", &digest[..32])
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn vector_id_is_deterministic_and_prefixed() {
        let fen = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
        let a = vector_id(fen);
        let b = vector_id(fen);
        assert_eq!(a, b);
        assert!(a.starts_with("fen:"));
        assert_eq!(a.len(), 4 + 32);
    }

    #[test]
    fn vector_id_differs_for_different_fens() {
        let a = vector_id("8/8/8/8/8/8/8/8 w - - 0 1");
        let b = vector_id("8/8/8/8/8/8/8/k7 w - - 0 1");
        assert_ne!(a, b);
    }

    #[test]
    fn chunking_respects_count_and_char_bounds() {
        let items: Vec<String> = (0..10).map(|i| format!("fen-{i}")).collect();
        let chunks = chunk_for_embedding(&items, 3, 1_000_000);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= 3));
    }

    #[test]
    fn oversized_single_item_gets_its_own_chunk() {
        let huge = "x".repeat(200);
        let items = vec!["short".to_string(), huge.clone(), "short2".to_string()];
        let chunks = chunk_for_embedding(&items, 10, 100);
        assert!(chunks.iter().any(|c| c.len() == 1 && c[0] == huge));
    }
}
