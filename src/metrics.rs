//! Prometheus metrics registry shared by the HTTP server and the embedding
//! worker. Series are registered once at startup and rendered as Prometheus
//! text exposition format for `GET /metrics`.

use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub rate_limit_rejections_total: IntCounterVec,
    pub agent_calls_total: IntCounterVec,
    pub agent_circuit_breaker_state: IntGauge,
    pub agent_cache_hits_total: IntCounterVec,
    pub agent_evaluation_latency_seconds: HistogramVec,
    pub embedding_jobs_claimed_total: IntCounterVec,
    pub embedding_jobs_completed_total: IntCounterVec,
    pub embedding_jobs_failed_total: IntCounterVec,
    pub embedding_jobs_pending: IntGauge,
    pub vector_upserts_total: IntCounterVec,
    pub db_pool_capacity: IntGauge,
    pub db_pool_in_use: IntGauge,
    pub db_pool_available: IntGauge,
    pub db_pool_waiting: IntGauge,
    pub db_pool_wait_ratio: Gauge,
    pub worker_jobs_per_minute: GaugeVec,
    pub worker_chars_per_second: GaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            prometheus::Opts::new("chessmate_http_requests_total", "HTTP requests by route and status"),
            &["route", "status"],
        )
        .unwrap();
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chessmate_http_request_duration_seconds",
                "HTTP request latency by route",
            ),
            &["route"],
        )
        .unwrap();
        let rate_limit_rejections_total = IntCounterVec::new(
            prometheus::Opts::new(
                "chessmate_rate_limit_rejections_total",
                "Requests rejected by the rate limiter",
            ),
            &["route"],
        )
        .unwrap();
        let agent_calls_total = IntCounterVec::new(
            prometheus::Opts::new("chessmate_agent_calls_total", "Agent evaluation calls by outcome"),
            &["outcome"],
        )
        .unwrap();
        let agent_circuit_breaker_state = IntGauge::new(
            "chessmate_agent_circuit_breaker_state",
            "Agent circuit breaker state (0=closed,1=open,2=half_open)",
        )
        .unwrap();
        let agent_cache_hits_total = IntCounterVec::new(
            prometheus::Opts::new("chessmate_agent_cache_hits_total", "Agent cache lookups by outcome"),
            &["outcome"],
        )
        .unwrap();
        let embedding_jobs_claimed_total = IntCounterVec::new(
            prometheus::Opts::new("chessmate_embedding_jobs_claimed_total", "Embedding jobs claimed"),
            &["worker"],
        )
        .unwrap();
        let embedding_jobs_completed_total = IntCounterVec::new(
            prometheus::Opts::new(
                "chessmate_embedding_jobs_completed_total",
                "Embedding jobs completed",
            ),
            &["worker"],
        )
        .unwrap();
        let embedding_jobs_failed_total = IntCounterVec::new(
            prometheus::Opts::new("chessmate_embedding_jobs_failed_total", "Embedding jobs failed"),
            &["worker"],
        )
        .unwrap();
        let embedding_jobs_pending = IntGauge::new(
            "chessmate_embedding_jobs_pending",
            "Embedding jobs currently pending",
        )
        .unwrap();
        let vector_upserts_total = IntCounterVec::new(
            prometheus::Opts::new("chessmate_vector_upserts_total", "Vector store upserts by outcome"),
            &["outcome"],
        )
        .unwrap();
        let agent_evaluation_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chessmate_agent_evaluation_latency_seconds",
                "Agent evaluation call latency",
            ),
            &["outcome"],
        )
        .unwrap();
        let db_pool_capacity = IntGauge::new(
            "chessmate_db_pool_capacity",
            "Configured relational connection pool capacity",
        )
        .unwrap();
        let db_pool_in_use = IntGauge::new(
            "chessmate_db_pool_in_use",
            "Relational connections currently checked out",
        )
        .unwrap();
        let db_pool_available = IntGauge::new(
            "chessmate_db_pool_available",
            "Relational connections currently idle in the pool",
        )
        .unwrap();
        let db_pool_waiting = IntGauge::new(
            "chessmate_db_pool_waiting",
            "Callers currently blocked on pool acquire",
        )
        .unwrap();
        let db_pool_wait_ratio = Gauge::new(
            "chessmate_db_pool_wait_ratio",
            "Fraction of pool capacity currently in use",
        )
        .unwrap();
        let worker_jobs_per_minute = GaugeVec::new(
            Opts::new(
                "chessmate_worker_jobs_per_minute",
                "Embedding jobs completed per minute over a sliding window",
            ),
            &["worker"],
        )
        .unwrap();
        let worker_chars_per_second = GaugeVec::new(
            Opts::new(
                "chessmate_worker_chars_per_second",
                "FEN characters embedded per second over a sliding window",
            ),
            &["worker"],
        )
        .unwrap();

        registry.register(Box::new(http_requests_total.clone())).unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(rate_limit_rejections_total.clone()))
            .unwrap();
        registry.register(Box::new(agent_calls_total.clone())).unwrap();
        registry
            .register(Box::new(agent_circuit_breaker_state.clone()))
            .unwrap();
        registry.register(Box::new(agent_cache_hits_total.clone())).unwrap();
        registry
            .register(Box::new(embedding_jobs_claimed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(embedding_jobs_completed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(embedding_jobs_failed_total.clone()))
            .unwrap();
        registry.register(Box::new(embedding_jobs_pending.clone())).unwrap();
        registry.register(Box::new(vector_upserts_total.clone())).unwrap();
        registry
            .register(Box::new(agent_evaluation_latency_seconds.clone()))
            .unwrap();
        registry.register(Box::new(db_pool_capacity.clone())).unwrap();
        registry.register(Box::new(db_pool_in_use.clone())).unwrap();
        registry.register(Box::new(db_pool_available.clone())).unwrap();
        registry.register(Box::new(db_pool_waiting.clone())).unwrap();
        registry.register(Box::new(db_pool_wait_ratio.clone())).unwrap();
        registry.register(Box::new(worker_jobs_per_minute.clone())).unwrap();
        registry
            .register(Box::new(worker_chars_per_second.clone()))
            .unwrap();

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            rate_limit_rejections_total,
            agent_calls_total,
            agent_circuit_breaker_state,
            agent_cache_hits_total,
            agent_evaluation_latency_seconds,
            embedding_jobs_claimed_total,
            embedding_jobs_completed_total,
            embedding_jobs_failed_total,
            embedding_jobs_pending,
            vector_upserts_total,
            db_pool_capacity,
            db_pool_in_use,
            db_pool_available,
            db_pool_waiting,
            db_pool_wait_ratio,
            worker_jobs_per_minute,
            worker_chars_per_second,
        }
    }

    /// Updates the `db_pool_*` gauges from a fresh [`crate::db::PoolStats`]
    /// snapshot. Called before every `/metrics` render.
    pub fn observe_pool_stats(&self, stats: crate::db::PoolStats) {
        self.db_pool_capacity.set(stats.capacity as i64);
        self.db_pool_in_use.set(stats.in_use as i64);
        self.db_pool_available.set(stats.available as i64);
        self.db_pool_waiting.set(stats.waiting as i64);
        let ratio = if stats.capacity == 0 {
            0.0
        } else {
            stats.in_use as f64 / stats.capacity as f64
        };
        self.db_pool_wait_ratio.set(ratio);
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).unwrap();
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds route-label cardinality: unknown paths collapse to `other` so a
/// client can't inflate the metric's label set by hammering random paths.
pub fn route_label(path: &str) -> &'static str {
    match path {
        "/query" => "query",
        "/health" => "health",
        "/metrics" => "metrics",
        "/openapi.yaml" => "openapi",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_series() {
        let metrics = Metrics::new();
        metrics
            .http_requests_total
            .with_label_values(&["query", "200"])
            .inc();
        let rendered = metrics.render();
        assert!(rendered.contains("chessmate_http_requests_total"));
    }

    #[test]
    fn route_label_bounds_cardinality() {
        assert_eq!(route_label("/query"), "query");
        assert_eq!(route_label("/anything/else"), "other");
    }
}
