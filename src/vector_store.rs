//! The vector store: a Qdrant collaborator accessed over its HTTP API.
//!
//! Only the verbs the core needs are modelled: similarity search and point
//! upsert. The wire dialect beyond those two calls is out of scope — we
//! speak just enough of Qdrant's REST surface (`/collections/{name}/points
//! /search` and `/collections/{name}/points`) to drive them.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::embedding::EmbeddingProvider;
use crate::error::AppError;
use crate::models::{QueryPlan, VectorHit};

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embeds `plan.cleaned_text` through the configured embedding
    /// provider and runs a similarity search against the collection.
    async fn search(&self, plan: &QueryPlan, limit: i64) -> Result<Vec<VectorHit>, AppError>;

    async fn upsert_points(&self, points: Vec<VectorPoint>) -> Result<(), AppError>;

    async fn health(&self) -> Result<(), AppError>;

    /// Triggers a server-side snapshot of the collection, returning the
    /// location Qdrant reports for it.
    async fn snapshot(&self) -> Result<String, AppError>;

    /// Restores the collection from a previously taken snapshot name.
    async fn restore(&self, snapshot_name: &str) -> Result<(), AppError>;

    /// Lists snapshots currently known to the vector store.
    async fn list_snapshots(&self) -> Result<Vec<String>, AppError>;
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

pub struct QdrantVectorStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl QdrantVectorStore {
    pub fn new(
        base_url: String,
        collection: String,
        timeout: Duration,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url,
            collection,
            embedder,
        }
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn search(&self, plan: &QueryPlan, limit: i64) -> Result<Vec<VectorHit>, AppError> {
        let query_vector = self.embedder.embed_query(&plan.cleaned_text).await?;

        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );
        let body = json!({
            "vector": query_vector,
            "limit": limit,
            "with_payload": true,
        });

        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "qdrant search returned {}",
                resp.status()
            )));
        }
        let parsed: serde_json::Value = resp.json().await?;
        let results = parsed
            .get("result")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut hits = Vec::with_capacity(results.len());
        for item in results {
            let score = item.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let payload = item.get("payload").cloned().unwrap_or(json!({}));
            let Some(game_id) = payload.get("game_id").and_then(|v| v.as_i64()) else {
                continue;
            };
            hits.push(VectorHit {
                game_id,
                score,
                phases: string_list(&payload, "phases"),
                themes: string_list(&payload, "themes"),
                keywords: string_list(&payload, "keywords"),
            });
        }
        Ok(hits)
    }

    async fn upsert_points(&self, points: Vec<VectorPoint>) -> Result<(), AppError> {
        let url = format!("{}/collections/{}/points", self.base_url, self.collection);
        let body = json!({
            "points": points.iter().map(|p| json!({
                "id": p.id,
                "vector": p.vector,
                "payload": p.payload,
            })).collect::<Vec<_>>(),
        });
        let resp = self.client.put(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "qdrant upsert returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), AppError> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let resp = self.client.get(&url).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(AppError::UpstreamUnavailable(format!(
                "qdrant health check returned {}",
                resp.status()
            )))
        }
    }

    async fn snapshot(&self) -> Result<String, AppError> {
        let url = format!(
            "{}/collections/{}/snapshots",
            self.base_url, self.collection
        );
        let resp = self.client.post(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "qdrant snapshot returned {}",
                resp.status()
            )));
        }
        let parsed: serde_json::Value = resp.json().await?;
        parsed
            .get("result")
            .and_then(|v| v.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AppError::SchemaViolation("qdrant snapshot response missing name".to_string()))
    }

    async fn restore(&self, snapshot_name: &str) -> Result<(), AppError> {
        let url = format!(
            "{}/collections/{}/snapshots/{}/recover",
            self.base_url, self.collection, snapshot_name
        );
        let body = json!({ "location": snapshot_name });
        let resp = self.client.put(&url).json(&body).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(AppError::UpstreamUnavailable(format!(
                "qdrant restore returned {}",
                resp.status()
            )))
        }
    }

    async fn list_snapshots(&self) -> Result<Vec<String>, AppError> {
        let url = format!(
            "{}/collections/{}/snapshots",
            self.base_url, self.collection
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "qdrant list snapshots returned {}",
                resp.status()
            )));
        }
        let parsed: serde_json::Value = resp.json().await?;
        let names = parsed
            .get("result")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| item.get("name").and_then(|n| n.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}

fn string_list(payload: &serde_json::Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
