//! Configuration assembly and validation.
//!
//! Chessmate is configured entirely from environment variables (see
//! `spec.md` / `SPEC_FULL.md` §6, "Environment"). [`Config::from_env`] reads
//! and validates every recognised option exactly once at process startup;
//! bad values fail fast before the server binds or the worker claims a job.

use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub vector_store_url: String,
    pub vector_collection: String,
    pub redis_url: Option<String>,
    pub collection_log_path: String,

    pub agent: AgentConfig,
    pub rate_limit: RateLimitConfig,
    pub worker: WorkerConfig,
    pub embedding: EmbeddingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
    pub candidate_multiplier: i64,
    pub candidate_max: i64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooloff: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: f64,
    pub bucket_size: f64,
    pub body_bytes_per_minute: Option<f64>,
    pub max_request_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: i64,
    pub health_port: u16,
    pub metrics_path: Option<String>,
    pub max_pending_embeddings: i64,
    pub stale_job_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dims: usize,
    pub chunk_size: usize,
    pub max_chars: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub request_deadline: Duration,
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got '{}'", key, v)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL must be set (postgres connection string)")?;
        let vector_store_url = env_str("VECTOR_STORE_URL", "http://localhost:6333");
        let vector_collection = env_str("VECTOR_COLLECTION", "chessmate_positions");
        let redis_url = env_opt_str("REDIS_URL");
        let collection_log_path = env_str("CHESSMATE_COLLECTION_LOG", "chessmate_snapshots.jsonl");

        let agent = AgentConfig {
            api_base: env_str("AGENT_API_BASE", "https://api.openai.com/v1"),
            api_key: env_opt_str("AGENT_API_KEY"),
            model: env_str("AGENT_MODEL", "gpt-4o-mini"),
            request_timeout: Duration::from_secs_f64(env_parsed(
                "AGENT_REQUEST_TIMEOUT_SECONDS",
                15.0,
            )?),
            candidate_multiplier: env_parsed("AGENT_CANDIDATE_MULTIPLIER", 5)?,
            candidate_max: env_parsed("AGENT_CANDIDATE_MAX", 25)?,
            circuit_breaker_threshold: env_parsed("AGENT_CIRCUIT_BREAKER_THRESHOLD", 5)?,
            circuit_breaker_cooloff: Duration::from_secs_f64(env_parsed(
                "AGENT_CIRCUIT_BREAKER_COOLOFF_SECONDS",
                60.0,
            )?),
        };

        let requests_per_minute: f64 = env_parsed("RATE_LIMIT_REQUESTS_PER_MINUTE", 60.0)?;
        let rate_limit = RateLimitConfig {
            requests_per_minute,
            bucket_size: env_parsed("RATE_LIMIT_BUCKET_SIZE", requests_per_minute)?,
            body_bytes_per_minute: {
                let v: f64 = env_parsed("RATE_LIMIT_BODY_BYTES_PER_MINUTE", 0.0)?;
                if v > 0.0 {
                    Some(v)
                } else {
                    None
                }
            },
            max_request_body_bytes: env_parsed("MAX_REQUEST_BODY_BYTES", 1_048_576usize)?,
        };

        let worker = WorkerConfig {
            batch_size: env_parsed("WORKER_BATCH_SIZE", 16)?,
            health_port: env_parsed("WORKER_HEALTH_PORT", 8081)?,
            metrics_path: env_opt_str("WORKER_METRICS_PATH"),
            max_pending_embeddings: env_parsed("MAX_PENDING_EMBEDDINGS", 250_000)?,
            stale_job_grace: Duration::from_secs(env_parsed(
                "CHESSMATE_STALE_JOB_GRACE_SECONDS",
                900,
            )?),
        };

        let embedding = EmbeddingConfig {
            provider: env_str("EMBEDDING_PROVIDER", "openai"),
            api_base: env_str("EMBEDDING_API_BASE", "https://api.openai.com/v1"),
            api_key: env_opt_str("EMBEDDING_API_KEY"),
            model: env_str("EMBEDDING_MODEL", "text-embedding-3-small"),
            dims: env_parsed("EMBEDDING_DIMS", 1536)?,
            chunk_size: env_parsed("EMBEDDING_CHUNK_SIZE", 2048)?,
            max_chars: env_parsed("EMBEDDING_MAX_CHARS", 120_000)?,
        };

        let server = ServerConfig {
            bind: env_str("CHESSMATE_BIND", "0.0.0.0:8080"),
            request_deadline: Duration::from_secs_f64(env_parsed(
                "CHESSMATE_REQUEST_DEADLINE_SECONDS",
                30.0,
            )?),
        };

        let config = Config {
            database_url,
            vector_store_url,
            vector_collection,
            redis_url,
            collection_log_path,
            agent,
            rate_limit,
            worker,
            embedding,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.batch_size < 1 || self.worker.batch_size > 256 {
            bail!("WORKER_BATCH_SIZE must be in [1, 256]");
        }
        if self.worker.health_port == 0 {
            bail!("WORKER_HEALTH_PORT must be > 0");
        }
        if self.agent.candidate_multiplier < 1 {
            bail!("AGENT_CANDIDATE_MULTIPLIER must be >= 1");
        }
        if self.agent.candidate_max < 1 {
            bail!("AGENT_CANDIDATE_MAX must be >= 1");
        }
        if self.embedding.dims == 0 {
            bail!("EMBEDDING_DIMS must be > 0");
        }
        if self.embedding.chunk_size == 0 {
            bail!("EMBEDDING_CHUNK_SIZE must be > 0");
        }
        match self.embedding.provider.as_str() {
            "openai" | "disabled" => {}
            other => bail!("Unknown embedding provider: '{}'. Must be openai or disabled.", other),
        }
        if self.rate_limit.requests_per_minute <= 0.0 {
            bail!("RATE_LIMIT_REQUESTS_PER_MINUTE must be > 0");
        }
        Ok(())
    }
}
