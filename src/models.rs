//! Core data types shared across the query pipeline, the embedding worker,
//! and the HTTP/CLI surfaces.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single chess game as stored in the relational store.
#[derive(Debug, Clone, Serialize)]
pub struct Game {
    pub id: i64,
    pub white_name: String,
    pub black_name: String,
    pub result: Option<String>,
    pub event: Option<String>,
    pub site: Option<String>,
    pub round: Option<String>,
    pub played_on: Option<NaiveDate>,
    pub eco_code: Option<String>,
    pub opening_slug: Option<String>,
    pub opening_name: Option<String>,
    pub white_rating: Option<i32>,
    pub black_rating: Option<i32>,
    #[serde(skip)]
    pub pgn: Option<String>,
}

/// A single ply within a game.
#[derive(Debug, Clone)]
pub struct Position {
    pub game_id: i64,
    pub ply: i32,
    pub san: String,
    pub fen: String,
    pub side_to_move: char,
    pub vector_id: Option<String>,
}

/// State machine for a single embedding job. One row per position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "in_progress" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub id: i64,
    pub game_id: i64,
    pub ply: i32,
    pub status: JobStatus,
    pub fen: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A single `{field, value}` filter extracted by the intent analyser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanFilter {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RatingConstraint {
    pub white_min: Option<i32>,
    pub black_min: Option<i32>,
    pub max_rating_delta: Option<i32>,
}

/// The structured output of [`crate::intent::analyse`], consumed by
/// [`crate::hybrid::execute`].
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    pub cleaned_text: String,
    pub filters: Vec<PlanFilter>,
    pub rating: RatingConstraint,
    pub keywords: Vec<String>,
    pub limit: i64,
    pub offset: i64,
}

impl QueryPlan {
    /// A stable hash over the normalised plan, used as a cache-key prefix.
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.cleaned_text.as_bytes());
        for f in &self.filters {
            hasher.update(f.field.as_bytes());
            hasher.update(b"=");
            hasher.update(f.value.as_bytes());
            hasher.update(b";");
        }
        let mut keywords = self.keywords.clone();
        keywords.sort();
        for k in &keywords {
            hasher.update(k.as_bytes());
            hasher.update(b",");
        }
        if let Some(v) = self.rating.white_min {
            hasher.update(format!("wm={v};").as_bytes());
        }
        if let Some(v) = self.rating.black_min {
            hasher.update(format!("bm={v};").as_bytes());
        }
        if let Some(v) = self.rating.max_rating_delta {
            hasher.update(format!("mrd={v};").as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A raw hit returned by the vector store, before per-`game_id` collapse.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub game_id: i64,
    pub score: f64,
    pub phases: Vec<String>,
    pub themes: Vec<String>,
    pub keywords: Vec<String>,
}

/// A score produced by the LLM agent for one candidate game.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEvaluation {
    pub game_id: i64,
    pub score: f64,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub themes: Vec<String>,
}

/// One row of the final, paginated result set.
#[derive(Debug, Clone, Serialize)]
pub struct ResultItem {
    pub game_id: i64,
    pub white: String,
    pub black: String,
    pub result: Option<String>,
    pub event: Option<String>,
    pub opening: Option<String>,
    pub eco_code: Option<String>,
    pub white_rating: Option<i32>,
    pub black_rating: Option<i32>,
    pub played_on: Option<NaiveDate>,
    pub score: f64,
    pub vector_score: f64,
    pub keyword_score: f64,
    pub agent_score: Option<f64>,
    pub agent_explanation: Option<String>,
    pub themes: Vec<String>,
    pub phases: Vec<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub offset: i64,
    pub limit: i64,
    pub total: i64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Disabled,
    Enabled,
    Timeout,
    Error,
    CircuitOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub status: AgentStatus,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteOutcome {
    pub results: Vec<ResultItem>,
    pub warnings: Vec<String>,
    pub pagination: Pagination,
    pub agent: AgentInfo,
}
