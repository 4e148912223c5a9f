//! Black-box tests of the hybrid query pipeline and the rate limiter,
//! exercised through chessmate's public API with injected fakes — no
//! Postgres/Qdrant/Redis/OpenAI connection required.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chessmate::circuit_breaker::CircuitBreaker;
use chessmate::error::AppError;
use chessmate::hybrid::{HybridConfig, HybridExecutor};
use chessmate::intent;
use chessmate::models::{Game, QueryPlan, VectorHit};
use chessmate::opening_catalogue::StaticOpeningCatalogue;
use chessmate::rate_limit::RateLimiter;
use chessmate::store::GameStore;
use chessmate::vector_store::{VectorPoint, VectorStore};

struct FixedGames(Vec<Game>);

#[async_trait]
impl GameStore for FixedGames {
    async fn fetch_games(
        &self,
        _plan: &QueryPlan,
        _limit: i64,
        _offset: i64,
    ) -> Result<(Vec<Game>, i64), AppError> {
        Ok((self.0.clone(), self.0.len() as i64))
    }

    async fn fetch_game_pgns(&self, ids: &[i64]) -> Result<HashMap<i64, String>, AppError> {
        Ok(ids.iter().map(|id| (*id, "1. d4 Nf6".to_string())).collect())
    }
}

struct FixedVectors(Vec<VectorHit>);

#[async_trait]
impl VectorStore for FixedVectors {
    async fn search(&self, _plan: &QueryPlan, _limit: i64) -> Result<Vec<VectorHit>, AppError> {
        Ok(self.0.clone())
    }
    async fn upsert_points(&self, _points: Vec<VectorPoint>) -> Result<(), AppError> {
        Ok(())
    }
    async fn health(&self) -> Result<(), AppError> {
        Ok(())
    }
    async fn snapshot(&self) -> Result<String, AppError> {
        Ok("snap".to_string())
    }
    async fn restore(&self, _snapshot_name: &str) -> Result<(), AppError> {
        Ok(())
    }
    async fn list_snapshots(&self) -> Result<Vec<String>, AppError> {
        Ok(Vec::new())
    }
}

fn kings_indian_game() -> Game {
    Game {
        id: 1,
        white_name: "Carlsen".to_string(),
        black_name: "Nepomniachtchi".to_string(),
        result: Some("1-0".to_string()),
        event: Some("Candidates".to_string()),
        site: None,
        round: None,
        played_on: None,
        eco_code: Some("E97".to_string()),
        opening_slug: Some("kings-indian".to_string()),
        opening_name: Some("King's Indian Defense".to_string()),
        white_rating: Some(2870),
        black_rating: Some(2790),
        pgn: Some("1. d4 Nf6".to_string()),
    }
}

/// Spec §8 scenario 1: "Show me King's Indian games where white is rated
/// at least 2800 and highlight middlegame tactics" against one matching
/// game with a strong vector hit.
#[tokio::test]
async fn hybrid_merge_happy_path() {
    let catalogue = StaticOpeningCatalogue;
    let plan = intent::analyse(
        "Show me King's Indian games where white is rated at least 2800 and highlight middlegame tactics",
        None,
        None,
        &catalogue,
    );

    assert!(plan
        .filters
        .iter()
        .any(|f| f.field == "opening" && f.value == "kings-indian"));
    assert_eq!(plan.rating.white_min, Some(2800));

    let executor = HybridExecutor {
        games: Arc::new(FixedGames(vec![kings_indian_game()])),
        vectors: Arc::new(FixedVectors(vec![VectorHit {
            game_id: 1,
            score: 0.92,
            phases: vec!["middlegame".to_string()],
            themes: vec!["tactics".to_string()],
            keywords: vec!["indian".to_string(), "attack".to_string()],
        }])),
        agent: None,
        agent_cache: None,
        circuit_breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
        config: HybridConfig::default(),
    };

    let outcome = executor.execute(&plan).await.unwrap();

    assert_eq!(outcome.results.len(), 1);
    let result = &outcome.results[0];
    assert!(result.themes.iter().any(|t| t == "tactics"));
    assert!(result.phases.iter().any(|p| p == "middlegame"));
    assert!((result.vector_score - 0.92).abs() < 1e-9);
    assert!(outcome.warnings.is_empty());
    assert_eq!(outcome.pagination.total, 1);
    assert!(!outcome.pagination.has_more);
}

/// Spec §8 scenario 6: the first request from a client is allowed, the
/// second immediate one is rate-limited with a positive retry-after.
#[test]
fn rate_limit_allows_then_limits_burst_of_one() {
    let limiter = RateLimiter::new(
        60.0,
        1.0,
        None,
        Duration::from_secs(60),
        Duration::from_millis(500),
    );

    let first = limiter.check("10.0.0.5", None);
    assert!(first.allowed);

    let second = limiter.check("10.0.0.5", None);
    assert!(!second.allowed);
    assert!(second.retry_after.unwrap() > Duration::ZERO);
}

/// Spec §8 invariant 1: `analyse` always produces a plan with
/// `1 <= limit <= 500` and `offset >= 0`, even for pathological input.
#[test]
fn analyse_never_produces_an_out_of_range_plan() {
    let catalogue = StaticOpeningCatalogue;
    let inputs = [
        "",
        "give me 10000 games",
        "top 0 games",
        "just some random text with no structure at all",
    ];
    for text in inputs {
        let plan = intent::analyse(text, None, None, &catalogue);
        assert!(plan.limit >= 1 && plan.limit <= 500, "limit out of range for {text:?}");
        assert!(plan.offset >= 0, "offset negative for {text:?}");
    }
}
