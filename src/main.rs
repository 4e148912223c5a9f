//! # Chessmate CLI
//!
//! The `chessmate` binary: schema migrations, PGN ingestion, one-shot
//! natural-language queries, vector-store snapshot management, health
//! checks, and the two long-running processes (`serve api`, `serve worker`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use chessmate::agent::{AgentEvaluator, OpenAIAgentEvaluator};
use chessmate::cache::{AgentCache, InMemoryAgentCache, RedisAgentCache};
use chessmate::circuit_breaker::CircuitBreaker;
use chessmate::config::Config;
use chessmate::embedding::{DisabledEmbeddingProvider, EmbeddingProvider, OpenAIEmbeddingProvider};
use chessmate::error::AppError;
use chessmate::health::HealthChecker;
use chessmate::hybrid::{HybridConfig, HybridExecutor};
use chessmate::opening_catalogue::StaticOpeningCatalogue;
use chessmate::store::{GameStore, JobStore, PostgresGameStore, PostgresJobStore};
use chessmate::vector_store::{QdrantVectorStore, VectorStore};
use chessmate::{collection, ingest, intent, metrics, migrate, models, sanitize, server, store, tempfile_guard, worker};

const AGENT_CACHE_CAPACITY: usize = 10_000;
const AGENT_CACHE_TTL: Duration = Duration::from_secs(3600);
const EMBEDDING_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const VECTOR_STORE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "chessmate",
    about = "Natural-language retrieval over a corpus of chess games",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the relational schema, idempotently
    Migrate,

    /// Ingest a PGN file: upsert games, enqueue one embedding job per position
    Ingest {
        /// Path to a PGN file
        pgn_file: PathBuf,
    },

    /// Run a natural-language question through the hybrid query pipeline
    Query {
        /// The question to ask
        question: String,

        /// Print the raw JSON response instead of a formatted table
        #[arg(long)]
        json: bool,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        offset: Option<i64>,
    },

    /// Manage vector-store snapshots
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Run the same dependency probes the API serves on `/health`
    Health,

    /// Run a long-lived process
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Trigger a vector-store snapshot and record it in the local log
    Snapshot {
        #[arg(long)]
        note: Option<String>,
    },
    /// Restore the vector store from a named snapshot
    Restore { name: String },
    /// List known snapshots, merging the vector store's listing with local notes
    List,
}

#[derive(Subcommand)]
enum ServeService {
    /// The query HTTP server
    Api,
    /// The embedding worker process
    Worker,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    if let Err(e) = tempfile_guard::install_signal_cleanup() {
        tracing::warn!(error = %e, "failed to install signal cleanup handler");
    }

    let cli = Cli::parse();
    let code = run(cli).await;
    tempfile_guard::cleanup_all();
    code
}

async fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Commands::Migrate => run_migrate().await,
        Commands::Ingest { pgn_file } => run_ingest(pgn_file).await,
        Commands::Query {
            question,
            json,
            limit,
            offset,
        } => run_query(question, json, limit, offset).await,
        Commands::Collection { action } => run_collection(action).await,
        Commands::Health => run_health().await,
        Commands::Serve { service } => run_serve(service).await,
    }
}

fn load_config() -> Result<Config, ExitCode> {
    Config::from_env().map_err(|e| {
        eprintln!("configuration error: {e:#}");
        ExitCode::from(1)
    })
}

async fn run_migrate() -> ExitCode {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let pool = match store::connect(&config.database_url).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("database connection failed: {e}");
            return ExitCode::from(1);
        }
    };
    match migrate::run_migrations(&pool).await {
        Ok(()) => {
            println!("schema is up to date");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("migration failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Exit codes per `ingest <pgn-file>`: 0 success, 1 parse/DB error, 2 the
/// queue-pressure guard refused to enqueue more jobs.
async fn run_ingest(pgn_file: PathBuf) -> ExitCode {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let pool = match store::connect(&config.database_url).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("database connection failed: {e}");
            return ExitCode::from(1);
        }
    };
    let jobs: Box<dyn JobStore> = Box::new(PostgresJobStore::new(pool.clone()));

    match ingest::ingest_pgn_file(&pool, jobs.as_ref(), &pgn_file, config.worker.max_pending_embeddings).await {
        Ok(ingest::IngestOutcome::Completed(report)) => {
            println!(
                "ingested {} games, enqueued {} positions, skipped {} games",
                report.games_ingested, report.positions_enqueued, report.games_skipped
            );
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
            ExitCode::SUCCESS
        }
        Ok(ingest::IngestOutcome::QueuePressure { pending, max_pending }) => {
            eprintln!(
                "refusing to ingest: {pending} jobs already pending (max {max_pending})"
            );
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("ingest failed: {}", sanitize::sanitize(&e.to_string()));
            ExitCode::from(1)
        }
    }
}

/// Exit codes per `query [...] <question>`: 0 success, 1 on error, 3 when
/// the request was rejected by the reliability fabric (throttled upstream
/// or a tripped policy such as the agent circuit breaker).
async fn run_query(question: String, json: bool, limit: Option<i64>, offset: Option<i64>) -> ExitCode {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let deps = match build_query_deps(&config).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("startup failed: {}", sanitize::sanitize(&e.to_string()));
            return ExitCode::from(1);
        }
    };

    let plan = intent::analyse(&question, limit, offset, &StaticOpeningCatalogue);
    let result = tokio::time::timeout(config.server.request_deadline, deps.hybrid.execute(&plan)).await;

    let outcome = match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => return report_query_error(e),
        Err(_) => return report_query_error(AppError::Timeout("request exceeded total deadline".to_string())),
    };

    if json {
        match serde_json::to_string_pretty(&outcome) {
            Ok(body) => println!("{body}"),
            Err(e) => {
                eprintln!("failed to encode response: {e}");
                return ExitCode::from(1);
            }
        }
    } else {
        print_results_table(&outcome);
    }
    ExitCode::SUCCESS
}

fn report_query_error(e: AppError) -> ExitCode {
    eprintln!("query failed: {}", sanitize::sanitize(&e.to_string()));
    match e {
        AppError::UpstreamThrottled(_) | AppError::PolicyViolation { .. } => ExitCode::from(3),
        _ => ExitCode::from(1),
    }
}

fn print_results_table(outcome: &models::ExecuteOutcome) {
    println!(
        "{} result(s), offset {} of {} total",
        outcome.results.len(),
        outcome.pagination.offset,
        outcome.pagination.total
    );
    for r in &outcome.results {
        println!(
            "  [{}] {} vs {} ({}) score={:.3}",
            r.game_id,
            r.white,
            r.black,
            r.result.as_deref().unwrap_or("*"),
            r.score
        );
    }
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
}

struct QueryDeps {
    hybrid: Arc<HybridExecutor>,
}

async fn build_query_deps(config: &Config) -> Result<QueryDeps, AppError> {
    let pool = store::connect(&config.database_url).await?;

    let embedding: Arc<dyn EmbeddingProvider> = match config.embedding.provider.as_str() {
        "openai" => Arc::new(OpenAIEmbeddingProvider::new(&config.embedding, EMBEDDING_CALL_TIMEOUT)?),
        _ => Arc::new(DisabledEmbeddingProvider::new(config.embedding.dims)),
    };

    let vectors: Arc<dyn VectorStore> = Arc::new(QdrantVectorStore::new(
        config.vector_store_url.clone(),
        config.vector_collection.clone(),
        VECTOR_STORE_TIMEOUT,
        embedding.clone(),
    ));

    let games: Arc<dyn GameStore> = Arc::new(PostgresGameStore::new(pool));

    let agent: Option<Arc<dyn AgentEvaluator>> = config.agent.api_key.as_ref().map(|key| {
        Arc::new(OpenAIAgentEvaluator::new(
            config.agent.api_base.clone(),
            Some(key.clone()),
            config.agent.model.clone(),
        )) as Arc<dyn AgentEvaluator>
    });

    let agent_cache: Option<Arc<dyn AgentCache>> = match &config.redis_url {
        Some(redis_url) => Some(Arc::new(RedisAgentCache::connect(redis_url, AGENT_CACHE_TTL).await?) as Arc<dyn AgentCache>),
        None => Some(Arc::new(InMemoryAgentCache::new(AGENT_CACHE_CAPACITY, AGENT_CACHE_TTL)) as Arc<dyn AgentCache>),
    };

    let circuit_breaker = Arc::new(CircuitBreaker::new(
        config.agent.circuit_breaker_threshold,
        config.agent.circuit_breaker_cooloff,
    ));

    let hybrid = Arc::new(HybridExecutor {
        games,
        vectors,
        agent,
        agent_cache,
        circuit_breaker,
        config: HybridConfig {
            candidate_multiplier: config.agent.candidate_multiplier,
            candidate_max: config.agent.candidate_max,
            agent_deadline: config.agent.request_timeout,
            ..HybridConfig::default()
        },
    });

    Ok(QueryDeps { hybrid })
}

async fn run_collection(action: CollectionAction) -> ExitCode {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let embedding: Arc<dyn EmbeddingProvider> = Arc::new(DisabledEmbeddingProvider::new(config.embedding.dims));
    let vectors = QdrantVectorStore::new(
        config.vector_store_url.clone(),
        config.vector_collection.clone(),
        VECTOR_STORE_TIMEOUT,
        embedding,
    );
    let log_path = PathBuf::from(&config.collection_log_path);

    let result = match action {
        CollectionAction::Snapshot { note } => collection::snapshot(&vectors, &log_path, note)
            .await
            .map(|record| println!("snapshot created: {} ({})", record.name, record.location)),
        CollectionAction::Restore { name } => collection::restore(&vectors, &name)
            .await
            .map(|()| println!("restored from snapshot {name}")),
        CollectionAction::List => collection::list(&vectors).await.map(|remote| {
            let local = collection::read_log(&log_path).unwrap_or_default();
            for name in &remote {
                let note = local
                    .iter()
                    .find(|r| &r.name == name)
                    .and_then(|r| r.note.as_deref());
                match note {
                    Some(note) => println!("{name}  ({note})"),
                    None => println!("{name}"),
                }
            }
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("collection command failed: {}", sanitize::sanitize(&e.to_string()));
            ExitCode::from(1)
        }
    }
}

async fn run_health() -> ExitCode {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let pool = match store::connect(&config.database_url).await {
        Ok(p) => Some(p),
        Err(e) => {
            eprintln!("warning: could not connect to database: {e}");
            None
        }
    };

    let embedding: Arc<dyn EmbeddingProvider> = match config.embedding.provider.as_str() {
        "openai" => match OpenAIEmbeddingProvider::new(&config.embedding, EMBEDDING_CALL_TIMEOUT) {
            Ok(p) => Arc::new(p),
            Err(_) => Arc::new(DisabledEmbeddingProvider::new(config.embedding.dims)),
        },
        _ => Arc::new(DisabledEmbeddingProvider::new(config.embedding.dims)),
    };
    let vectors: Arc<dyn VectorStore> = Arc::new(QdrantVectorStore::new(
        config.vector_store_url.clone(),
        config.vector_collection.clone(),
        VECTOR_STORE_TIMEOUT,
        embedding.clone(),
    ));

    let embedding_probe: Option<
        Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync>,
    > = if config.embedding.provider == "openai" {
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

    let cache_ping: Option<
        Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync>,
    > = match &config.redis_url {
        Some(redis_url) => match RedisAgentCache::connect(redis_url, AGENT_CACHE_TTL).await {
            Ok(redis) => {
                let redis = Arc::new(redis);
                Some(Arc::new(move || {
                    let redis = redis.clone();
                    Box::pin(async move { redis.ping().await.map_err(|e| e.to_string()) })
                        as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>
                }))
            }
            Err(_) => None,
        },
        None => None,
    };

    let checker = HealthChecker {
        pool,
        vectors: Some(vectors),
        cache_ping,
        embedding_probe,
        probe_timeout: PROBE_TIMEOUT,
    };
    let report = checker.check().await;
    match serde_json::to_string_pretty(&report) {
        Ok(body) => println!("{body}"),
        Err(e) => eprintln!("failed to encode health report: {e}"),
    }
    if report.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

async fn run_serve(service: ServeService) -> ExitCode {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let result = match service {
        ServeService::Api => server::run_server(config).await,
        ServeService::Worker => run_worker(config).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("server error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let pool = store::connect(&config.database_url).await?;
    let jobs: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));

    let embedding: Arc<dyn EmbeddingProvider> = match config.embedding.provider.as_str() {
        "openai" => Arc::new(OpenAIEmbeddingProvider::new(&config.embedding, EMBEDDING_CALL_TIMEOUT)?),
        _ => Arc::new(DisabledEmbeddingProvider::new(config.embedding.dims)),
    };
    let vectors: Arc<dyn VectorStore> = Arc::new(QdrantVectorStore::new(
        config.vector_store_url.clone(),
        config.vector_collection.clone(),
        VECTOR_STORE_TIMEOUT,
        embedding.clone(),
    ));

    let deps = Arc::new(worker::WorkerDeps {
        pool,
        jobs,
        embedder: embedding,
        vectors,
        metrics: Arc::new(metrics::Metrics::new()),
        batch_size: config.worker.batch_size,
        stale_job_grace: chrono::Duration::from_std(config.worker.stale_job_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(900)),
        health_port: config.worker.health_port,
        worker_label: "default".to_string(),
        chunk_size: config.embedding.chunk_size,
        max_chars: config.embedding.max_chars,
    });

    let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let signal_flag = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal_flag.store(true, std::sync::atomic::Ordering::Relaxed);
    });

    worker::run(deps, shutdown).await?;
    Ok(())
}
