//! The query HTTP server (Axum).
//!
//! Wires the intent analyser (§4.A) and the hybrid executor (§4.B) behind
//! `POST`/`GET /query`, and exposes the reliability fabric's health probes
//! and metrics registry on `GET /health` / `GET /metrics`. One [`AppState`]
//! is constructed in [`run_server`] and cloned (cheaply — every field is an
//! `Arc`) into every handler via Axum's `State` extractor, following this
//! codebase's existing preference for explicit app state over global
//! singletons (§9).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::agent::{AgentEvaluator, OpenAIAgentEvaluator};
use crate::cache::{AgentCache, InMemoryAgentCache, RedisAgentCache};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::db::pool_stats;
use crate::embedding::{DisabledEmbeddingProvider, EmbeddingProvider, OpenAIEmbeddingProvider};
use crate::error::AppError;
use crate::health::HealthChecker;
use crate::hybrid::{HybridConfig, HybridExecutor};
use crate::intent;
use crate::metrics::{route_label, Metrics};
use crate::models::QueryPlan;
use crate::opening_catalogue::{OpeningCatalogue, StaticOpeningCatalogue};
use crate::rate_limit::RateLimiter;
use crate::sanitize::sanitize;
use crate::store::{GameStore, PostgresGameStore};
use crate::vector_store::{QdrantVectorStore, VectorStore};

/// A hard safety cap on how much of a request body Axum will buffer before
/// our own, spec-exact 413 check ever runs. Well above any sane
/// `MAX_REQUEST_BODY_BYTES` so operators can still configure the real
/// limit through config alone.
const BODY_SAFETY_CAP_BYTES: usize = 64 * 1024 * 1024;

const AGENT_CACHE_CAPACITY: usize = 10_000;
const AGENT_CACHE_TTL: Duration = Duration::from_secs(3600);
const EMBEDDING_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const VECTOR_STORE_TIMEOUT: Duration = Duration::from_secs(10);
const RATE_LIMIT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_millis(500);

const OPENAPI_YAML: &str = include_str!("../openapi.yaml");

#[derive(Clone)]
pub struct AppState {
    pool: sqlx::PgPool,
    vectors: Arc<dyn VectorStore>,
    hybrid: Arc<HybridExecutor>,
    catalogue: Arc<dyn OpeningCatalogue>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    config: Arc<Config>,
    redis_cache: Option<Arc<RedisAgentCache>>,
    embedding: Arc<dyn EmbeddingProvider>,
}

/// Assembles [`AppState`] from config and starts serving `/query`,
/// `/health`, `/metrics`, and `/openapi.yaml` until the process is killed.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let pool = crate::store::connect(&config.database_url).await?;

    let embedding: Arc<dyn EmbeddingProvider> = match config.embedding.provider.as_str() {
        "openai" => Arc::new(OpenAIEmbeddingProvider::new(
            &config.embedding,
            EMBEDDING_CALL_TIMEOUT,
        )?),
        _ => Arc::new(DisabledEmbeddingProvider::new(config.embedding.dims)),
    };

    let vectors: Arc<dyn VectorStore> = Arc::new(QdrantVectorStore::new(
        config.vector_store_url.clone(),
        config.vector_collection.clone(),
        VECTOR_STORE_TIMEOUT,
        embedding.clone(),
    ));

    let games: Arc<dyn GameStore> = Arc::new(PostgresGameStore::new(pool.clone()));

    let agent: Option<Arc<dyn AgentEvaluator>> = config.agent.api_key.as_ref().map(|key| {
        Arc::new(OpenAIAgentEvaluator::new(
            config.agent.api_base.clone(),
            Some(key.clone()),
            config.agent.model.clone(),
        )) as Arc<dyn AgentEvaluator>
    });

    let redis_cache: Option<Arc<RedisAgentCache>> = match &config.redis_url {
        Some(redis_url) => Some(Arc::new(
            RedisAgentCache::connect(redis_url, AGENT_CACHE_TTL).await?,
        )),
        None => None,
    };
    let agent_cache: Option<Arc<dyn AgentCache>> = match &redis_cache {
        Some(redis) => Some(redis.clone() as Arc<dyn AgentCache>),
        None => Some(Arc::new(InMemoryAgentCache::new(
            AGENT_CACHE_CAPACITY,
            AGENT_CACHE_TTL,
        ))),
    };

    let circuit_breaker = Arc::new(CircuitBreaker::new(
        config.agent.circuit_breaker_threshold,
        config.agent.circuit_breaker_cooloff,
    ));

    let hybrid = Arc::new(HybridExecutor {
        games,
        vectors: vectors.clone(),
        agent,
        agent_cache: agent_cache.clone(),
        circuit_breaker,
        config: HybridConfig {
            candidate_multiplier: config.agent.candidate_multiplier,
            candidate_max: config.agent.candidate_max,
            agent_deadline: config.agent.request_timeout,
            ..HybridConfig::default()
        },
    });

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.requests_per_minute,
        config.rate_limit.bucket_size,
        config.rate_limit.body_bytes_per_minute,
        RATE_LIMIT_IDLE_TIMEOUT,
        RATE_LIMIT_PRUNE_INTERVAL,
    ));

    let state = AppState {
        pool,
        vectors,
        hybrid,
        catalogue: Arc::new(StaticOpeningCatalogue),
        rate_limiter,
        metrics: Arc::new(Metrics::new()),
        config: config.clone(),
        redis_cache,
        embedding,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/query", get(handle_query_get).post(handle_query_post))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/openapi.yaml", get(handle_openapi))
        .layer(DefaultBodyLimit::max(BODY_SAFETY_CAP_BYTES))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "query server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

// ============ request/response shapes ============

#[derive(Deserialize)]
struct QueryRequestBody {
    question: String,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Deserialize)]
struct QueryParamsGet {
    q: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct QueryResponse {
    question: String,
    plan: QueryPlan,
    results: Vec<crate::models::ResultItem>,
    pagination: crate::models::Pagination,
    warnings: Vec<String>,
    agent: crate::models::AgentInfo,
}

// ============ POST /query ============

async fn handle_query_post(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let started = Instant::now();
    let route = "query";
    let client_id = client_identity(&headers, addr);

    let max_body = state.config.rate_limit.max_request_body_bytes;
    if max_body > 0 && body.len() > max_body {
        return record_and_respond(
            &state,
            route,
            started,
            AppError::PayloadTooLarge(format!("request body exceeds {max_body} bytes"))
                .into_response(),
        );
    }

    let decision = state.rate_limiter.check(&client_id, Some(body.len() as u64));
    if !decision.allowed {
        return record_and_respond(
            &state,
            route,
            started,
            rate_limited_response(&state, route, decision.retry_after),
        );
    }

    let parsed: QueryRequestBody = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return record_and_respond(
                &state,
                route,
                started,
                AppError::Validation(format!("malformed request body: {e}")).into_response(),
            )
        }
    };

    if parsed.question.trim().is_empty() {
        return record_and_respond(
            &state,
            route,
            started,
            AppError::Validation("question must not be empty".to_string()).into_response(),
        );
    }

    let response = run_query(&state, &parsed.question, parsed.limit, parsed.offset).await;
    record_and_respond(&state, route, started, response_into_response(response))
}

// ============ GET /query ============

async fn handle_query_get(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<QueryParamsGet>,
) -> Response {
    let started = Instant::now();
    let route = "query";
    let client_id = client_identity(&headers, addr);

    let decision = state.rate_limiter.check(&client_id, None);
    if !decision.allowed {
        return record_and_respond(
            &state,
            route,
            started,
            rate_limited_response(&state, route, decision.retry_after),
        );
    }

    let question = match params.q.filter(|q| !q.trim().is_empty()) {
        Some(q) => q,
        None => {
            return record_and_respond(
                &state,
                route,
                started,
                AppError::Validation("question must not be empty".to_string()).into_response(),
            )
        }
    };

    let response = run_query(&state, &question, params.limit, params.offset).await;
    record_and_respond(&state, route, started, response_into_response(response))
}

/// Shared execution path for both `/query` entry points: analyse the
/// question into a plan, then run the hybrid executor under the
/// server's total per-request deadline (§5, "Cancellation & timeouts").
async fn run_query(
    state: &AppState,
    question: &str,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<QueryResponse, AppError> {
    let plan = intent::analyse(question, limit, offset, state.catalogue.as_ref());

    let outcome = tokio::time::timeout(
        state.config.server.request_deadline,
        state.hybrid.execute(&plan),
    )
    .await
    .map_err(|_| AppError::Timeout("request exceeded total deadline".to_string()))??;

    Ok(QueryResponse {
        question: question.to_string(),
        plan,
        results: outcome.results,
        pagination: outcome.pagination,
        warnings: outcome.warnings,
        agent: outcome.agent,
    })
}

fn response_into_response(result: Result<QueryResponse, AppError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_response(),
    }
}

// ============ GET /health ============

async fn handle_health(State(state): State<AppState>) -> Response {
    let checker = build_health_checker(&state);
    let report = checker.check().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

fn build_health_checker(state: &AppState) -> HealthChecker {
    let cache_ping: Option<
        Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync>,
    > = state.redis_cache.clone().map(|redis| {
        Arc::new(move || {
            let redis = redis.clone();
            Box::pin(async move { redis.ping().await.map_err(|e| e.to_string()) })
                as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>
        }) as Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync>
    });

    let embedding = state.embedding.clone();
    let embedding_probe: Option<
        Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync>,
    > = if state.config.embedding.provider == "openai" {
        Some(Arc::new(move || {
            let embedding = embedding.clone();
            Box::pin(async move {
                embedding
                    .embed_query("health check probe")
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>
        }))
    } else {
        None
    };

    HealthChecker {
        pool: Some(state.pool.clone()),
        vectors: Some(state.vectors.clone()),
        cache_ping,
        embedding_probe,
        probe_timeout: Duration::from_secs(2),
    }
}

// ============ GET /metrics ============

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.observe_pool_stats(pool_stats(&state.pool));
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

// ============ GET /openapi.yaml ============

async fn handle_openapi() -> impl IntoResponse {
    ([("content-type", "application/yaml")], OPENAPI_YAML)
}

// ============ shared helpers ============

fn client_identity(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn rate_limited_response(state: &AppState, route: &str, retry_after: Option<Duration>) -> Response {
    let secs = retry_after.map(|d| d.as_secs_f64().ceil() as u64).unwrap_or(1);
    state
        .metrics
        .rate_limit_rejections_total
        .with_label_values(&[route])
        .inc();
    AppError::PolicyViolation {
        message: "rate limit exceeded".to_string(),
        retry_after: Some(secs),
    }
    .into_response()
}

fn record_and_respond(
    state: &AppState,
    route: &str,
    started: Instant,
    response: Response,
) -> Response {
    let label = route_label(&format!("/{route}"));
    let status = response.status().as_u16().to_string();
    state
        .metrics
        .http_requests_total
        .with_label_values(&[label, &status])
        .inc();
    state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&[label])
        .observe(started.elapsed().as_secs_f64());
    if !response.status().is_success() {
        tracing::warn!(route = label, status = %status, "query request failed");
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_identity_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.5, 10.0.0.1".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(client_identity(&headers, addr), "10.0.0.5");
    }

    #[test]
    fn client_identity_falls_back_to_peer_addr() {
        let headers = HeaderMap::new();
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(client_identity(&headers, addr), "127.0.0.1");
    }

    #[test]
    fn error_message_is_sanitised() {
        let err = AppError::UpstreamUnavailable(
            "connect to postgres://user:hunter2@db/chessmate failed".to_string(),
        );
        let sanitised = sanitize(&err.to_string());
        assert!(!sanitised.contains("hunter2"));
    }
}
