//! # Chessmate
//!
//! **A self-hosted natural-language retrieval engine for chess games.**
//!
//! Chessmate ingests PGN archives into Postgres, embeds every reachable
//! position into a vector store, and answers free-text questions
//! ("games where black sacrifices a piece in the sicilian before move 20")
//! through a hybrid pipeline: metadata filtering, vector similarity, lexical
//! keyword scoring, and an optional LLM agent re-rank of the top slice.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌────────────┐   ┌─────────────┐
//! │ PGN file │──▶│ ingest + pgn  │──▶│  Postgres   │   │  embedding   │
//! └──────────┘   └───────────────┘   │games/        │──▶│  worker      │
//!                                    │positions/    │   │ (own process)│
//!                                    │embedding_jobs│   └──────┬───────┘
//!                                    └──────────────┘          │
//!                                                               ▼
//!                                                        ┌────────────┐
//!                                                        │   Qdrant    │
//!                                                        └──────┬─────┘
//!                                                               │
//! ┌──────────┐   ┌──────────┐   ┌────────────────┐             │
//! │ question │──▶│  intent  │──▶│ hybrid executor │◀────────────┘
//! └──────────┘   └──────────┘   └────────┬───────┘
//!                                         ▼
//!                                 ┌───────────────┐
//!                                 │ optional agent │
//!                                 │ re-rank (LLM)  │
//!                                 └───────────────┘
//! ```
//!
//! ## Query pipeline
//!
//! 1. [`intent::analyse`] turns free text into a [`models::QueryPlan`]:
//!    filters, rating constraints, keywords, pagination.
//! 2. [`hybrid::HybridExecutor`] overfetches candidates from the relational
//!    store ([`store::GameStore`]) and the vector store
//!    ([`vector_store::VectorStore`]), merges them per game, and blends
//!    vector/keyword scores into a base score.
//! 3. For the top slice of candidates, an optional [`agent::AgentEvaluator`]
//!    re-scores results, fronted by [`cache::AgentCache`] and guarded by
//!    [`circuit_breaker::CircuitBreaker`].
//! 4. Results are sorted, paginated, and returned with warnings describing
//!    any degraded step (vector store down, agent timed out, ...).
//!
//! ## Ingestion pipeline
//!
//! [`pgn::parse_pgn`] turns a PGN file into games and positions, dropping
//! illegal or ambiguous games with a warning rather than failing the whole
//! file. [`ingest::ingest_pgn_file`] upserts games and enqueues one
//! `pending` [`models::EmbeddingJob`] per position, guarded by a
//! queue-pressure check. [`worker::run`] claims batches of jobs with
//! `FOR UPDATE SKIP LOCKED`, embeds their FENs via
//! [`embedding::EmbeddingProvider`], and upserts the resulting vectors.
//!
//! ## Reliability fabric
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`rate_limit`] | Per-client token-bucket request and body-byte limiting |
//! | [`circuit_breaker`] | Three-state breaker guarding the agent endpoint |
//! | [`retry`] | Generic async retry with exponential backoff and jitter |
//! | [`health`] | Aggregated dependency health probes |
//! | [`metrics`] | Prometheus registry shared by the server and the worker |
//! | [`sanitize`] | Idempotent secret redaction for logs and error bodies |
//! | [`tempfile_guard`] | Process-scoped temp file tracking with signal cleanup |
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-variable configuration assembly and validation |
//! | [`error`] | The `AppError` taxonomy and its HTTP/CLI mappings |
//! | [`models`] | Core data types shared across the query pipeline and worker |
//! | [`store`] | Postgres-backed `GameStore`/`JobStore` |
//! | [`vector_store`] | Qdrant-backed `VectorStore` |
//! | [`embedding`] | Embedding provider trait, OpenAI implementation, chunking |
//! | [`agent`] | LLM agent evaluator trait and OpenAI implementation |
//! | [`cache`] | Agent evaluation cache, in-memory and Redis-backed |
//! | [`intent`] | Free-text question analysis into a `QueryPlan` |
//! | [`opening_catalogue`] | Static ECO opening name/alias/range lookup |
//! | [`hybrid`] | The hybrid query executor |
//! | [`pgn`] | PGN parsing into games and positions |
//! | [`ingest`] | PGN ingestion: upsert games, enqueue embedding jobs |
//! | [`worker`] | The embedding worker process |
//! | [`collection`] | `chessmate collection` snapshot/restore/list orchestration |
//! | [`server`] | The query HTTP server (Axum) |
//! | [`db`] | Connection pool statistics |
//! | [`migrate`] | Idempotent schema migrations |
//!
//! ## Configuration
//!
//! Chessmate is configured entirely from environment variables; see
//! [`config::Config::from_env`] for the full list and their defaults.

pub mod agent;
pub mod cache;
pub mod circuit_breaker;
pub mod collection;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod health;
pub mod hybrid;
pub mod ingest;
pub mod intent;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod opening_catalogue;
pub mod pgn;
pub mod rate_limit;
pub mod retry;
pub mod sanitize;
pub mod server;
pub mod store;
pub mod tempfile_guard;
pub mod vector_store;
pub mod worker;
