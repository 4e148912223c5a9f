//! The hybrid executor: fuses relational filtering, vector similarity, and
//! lexical keyword scoring into one ranked result set, optionally re-scored
//! by the LLM agent for the top slice of candidates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::agent::AgentEvaluator;
use crate::cache::{cache_key, AgentCache};
use crate::circuit_breaker::{CircuitBreaker, Permit};
use crate::error::AppError;
use crate::models::{
    AgentEvaluation, AgentInfo, AgentStatus, ExecuteOutcome, Game, Pagination, QueryPlan,
    ResultItem, VectorHit,
};
use crate::store::GameStore;
use crate::vector_store::VectorStore;

const CACHE_NAMESPACE: &str = "agent_eval";

pub struct HybridConfig {
    pub candidate_multiplier: i64,
    pub candidate_max: i64,
    pub agent_deadline: Duration,
    /// Weight on `vector_component` in `base_score`. Fixed by the scoring
    /// contract at 0.7; exposed here only so tests can probe edge weights.
    pub vector_weight: f64,
    /// Weight on `keyword_component` in `base_score`. Fixed at 0.3.
    pub keyword_weight: f64,
    /// Weight on the agent score in the final blend. Fixed at 0.5.
    pub agent_weight: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            candidate_multiplier: 5,
            candidate_max: 25,
            agent_deadline: Duration::from_secs(15),
            vector_weight: 0.7,
            keyword_weight: 0.3,
            agent_weight: 0.5,
        }
    }
}

pub struct HybridExecutor {
    pub games: Arc<dyn GameStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub agent: Option<Arc<dyn AgentEvaluator>>,
    pub agent_cache: Option<Arc<dyn AgentCache>>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub config: HybridConfig,
}

impl HybridExecutor {
    /// Runs `plan` end to end: relational fetch + vector search, per-game
    /// merge and base scoring, an optional agent re-rank pass over the
    /// top slice, final sort, and pagination.
    pub async fn execute(&self, plan: &QueryPlan) -> Result<ExecuteOutcome, AppError> {
        let mut warnings = Vec::new();

        let overfetch = (plan.limit + plan.offset)
            .saturating_mul(self.config.candidate_multiplier)
            .max(plan.limit + plan.offset)
            .min(5_000);

        let (games, total) = self.games.fetch_games(plan, overfetch, 0).await?;

        if games.is_empty() {
            return Ok(ExecuteOutcome {
                results: Vec::new(),
                warnings,
                pagination: Pagination {
                    offset: plan.offset,
                    limit: plan.limit,
                    total,
                    has_more: false,
                },
                agent: AgentInfo {
                    status: AgentStatus::Disabled,
                    reasoning_effort: None,
                },
            });
        }

        let vector_hits = match self.vectors.search(plan, overfetch).await {
            Ok(hits) => hits,
            Err(e) => {
                warnings.push(format!("vector search unavailable: {}", sanitized(&e)));
                Vec::new()
            }
        };
        let vector_by_game = collapse_vector_hits(vector_hits);

        let games_by_id: HashMap<i64, &Game> = games.iter().map(|g| (g.id, g)).collect();

        let mut scored: Vec<ScoredCandidate> = games
            .iter()
            .map(|game| {
                let vhit = vector_by_game.get(&game.id);
                let vector_component = vhit
                    .map(|h| h.score)
                    .unwrap_or_else(|| fallback_vector_score(game, plan));
                let vhit_keywords = vhit.map(|h| h.keywords.as_slice()).unwrap_or(&[]);
                let keyword_component = keyword_score(game, vhit_keywords, &plan.keywords);
                let base = self.config.vector_weight * vector_component
                    + self.config.keyword_weight * keyword_component;
                ScoredCandidate {
                    game_id: game.id,
                    vector_score: vector_component,
                    keyword_score: keyword_component,
                    agent_score: None,
                    agent_explanation: None,
                    base_score: base,
                    final_score: base,
                    themes: vhit.map(|h| h.themes.clone()).unwrap_or_default(),
                    phases: vhit.map(|h| h.phases.clone()).unwrap_or_default(),
                    keywords: vhit.map(|h| h.keywords.clone()).unwrap_or_default(),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.base_score
                .partial_cmp(&a.base_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.game_id.cmp(&b.game_id))
        });

        // `plan.limit` and `self.config.candidate_max` can appear in either
        // order (e.g. limit=50 > candidate_max=25 with default config), so
        // clamp against the sorted bounds rather than risk `i64::clamp`
        // panicking on an inverted range.
        let budget_lo = plan.limit.min(self.config.candidate_max);
        let budget_hi = plan.limit.max(self.config.candidate_max);
        let agent_budget = self
            .config
            .candidate_multiplier
            .saturating_mul(plan.limit)
            .clamp(budget_lo, budget_hi)
            .max(0) as usize;

        let agent_info = if let Some(agent) = &self.agent {
            self.apply_agent_pass(plan, &mut scored, &games_by_id, agent.as_ref(), agent_budget, &mut warnings)
                .await
        } else {
            AgentInfo {
                status: AgentStatus::Disabled,
                reasoning_effort: None,
            }
        };

        scored.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let pa = games_by_id.get(&a.game_id).and_then(|g| g.played_on);
                    let pb = games_by_id.get(&b.game_id).and_then(|g| g.played_on);
                    pb.cmp(&pa)
                })
                .then_with(|| a.game_id.cmp(&b.game_id))
        });

        let page: Vec<ResultItem> = scored
            .into_iter()
            .skip(plan.offset as usize)
            .take(plan.limit as usize)
            .filter_map(|c| {
                let game = games_by_id.get(&c.game_id)?;
                Some(ResultItem {
                    game_id: c.game_id,
                    white: game.white_name.clone(),
                    black: game.black_name.clone(),
                    result: game.result.clone(),
                    event: game.event.clone(),
                    opening: game.opening_name.clone(),
                    eco_code: game.eco_code.clone(),
                    white_rating: game.white_rating,
                    black_rating: game.black_rating,
                    played_on: game.played_on,
                    score: c.final_score,
                    vector_score: c.vector_score,
                    keyword_score: c.keyword_score,
                    agent_score: c.agent_score,
                    agent_explanation: c.agent_explanation,
                    themes: c.themes,
                    phases: c.phases,
                    keywords: c.keywords,
                })
            })
            .collect();

        let has_more = plan.offset + (page.len() as i64) < total;

        Ok(ExecuteOutcome {
            results: page,
            warnings,
            pagination: Pagination {
                offset: plan.offset,
                limit: plan.limit,
                total,
                has_more,
            },
            agent: agent_info,
        })
    }

    async fn apply_agent_pass(
        &self,
        plan: &QueryPlan,
        scored: &mut [ScoredCandidate],
        games_by_id: &HashMap<i64, &Game>,
        agent: &dyn AgentEvaluator,
        budget: usize,
        warnings: &mut Vec<String>,
    ) -> AgentInfo {
        if budget == 0 {
            return AgentInfo {
                status: AgentStatus::Disabled,
                reasoning_effort: None,
            };
        }

        if self.circuit_breaker.check() == Permit::Deny {
            warnings.push("agent evaluation skipped: circuit breaker open".to_string());
            return AgentInfo {
                status: AgentStatus::CircuitOpen,
                reasoning_effort: None,
            };
        }

        let top_n = budget.min(scored.len());
        let digest = plan.digest();
        let keys: Vec<String> = scored[..top_n]
            .iter()
            .map(|c| cache_key(CACHE_NAMESPACE, &digest, c.game_id))
            .collect();

        let cached = match &self.agent_cache {
            Some(cache) => cache.get_many(&keys).await,
            None => vec![None; top_n],
        };

        let mut need_eval: Vec<i64> = Vec::new();
        for (idx, hit) in cached.iter().enumerate() {
            if hit.is_none() {
                need_eval.push(scored[idx].game_id);
            }
        }

        let mut fresh: Vec<AgentEvaluation> = Vec::new();
        let mut status = AgentStatus::Enabled;

        if !need_eval.is_empty() {
            let ids: Vec<i64> = need_eval;
            let game_ids: Vec<i64> = ids.clone();
            let mut candidates = Vec::new();
            for id in &game_ids {
                if let Some(game) = games_by_id.get(id) {
                    let pgn = game.pgn.clone().unwrap_or_default();
                    candidates.push(((*game).clone(), pgn));
                }
            }

            let start = Instant::now();
            match agent.evaluate(plan, &candidates, self.config.agent_deadline).await {
                Ok(evals) => {
                    self.circuit_breaker.record_success();
                    fresh = evals;
                }
                Err(AppError::Timeout(_)) => {
                    self.circuit_breaker.record_failure();
                    status = AgentStatus::Timeout;
                    warnings.push(format!(
                        "agent timeout after {:?}, falling back to base score",
                        start.elapsed()
                    ));
                }
                Err(e) => {
                    self.circuit_breaker.record_failure();
                    status = AgentStatus::Error;
                    warnings.push(format!("agent evaluation failed: {}", sanitized(&e)));
                }
            }

            if let Some(cache) = &self.agent_cache {
                let to_cache: Vec<(String, AgentEvaluation)> = fresh
                    .iter()
                    .map(|e| (cache_key(CACHE_NAMESPACE, &digest, e.game_id), e.clone()))
                    .collect();
                if !to_cache.is_empty() {
                    cache.put_many(to_cache).await;
                }
            }
        }

        let mut by_game: HashMap<i64, AgentEvaluation> = HashMap::new();
        for (idx, hit) in cached.into_iter().enumerate() {
            if let Some(eval) = hit {
                by_game.insert(scored[idx].game_id, eval);
            }
        }
        for eval in fresh {
            by_game.insert(eval.game_id, eval);
        }

        let mut covered = 0usize;
        for candidate in scored[..top_n].iter_mut() {
            if let Some(eval) = by_game.get(&candidate.game_id) {
                candidate.agent_score = Some(eval.score);
                candidate.agent_explanation = eval.explanation.clone();
                if !eval.themes.is_empty() {
                    candidate.themes = eval.themes.clone();
                }
                candidate.final_score =
                    candidate.base_score * (1.0 - self.config.agent_weight)
                        + eval.score * self.config.agent_weight;
                covered += 1;
            }
        }

        if covered < top_n && covered > 0 {
            warnings.push(format!(
                "agent evaluated {covered}/{top_n} candidates; remainder kept base score"
            ));
        }

        AgentInfo {
            status,
            reasoning_effort: None,
        }
    }
}

struct ScoredCandidate {
    game_id: i64,
    vector_score: f64,
    keyword_score: f64,
    agent_score: Option<f64>,
    agent_explanation: Option<String>,
    base_score: f64,
    final_score: f64,
    themes: Vec<String>,
    phases: Vec<String>,
    keywords: Vec<String>,
}

/// Deterministic stand-in for `vector_component` when no vector hit exists
/// for a candidate: rewards rating-range and opening matches so pure
/// metadata matches still rank, without ever reaching a real hit's range.
fn fallback_vector_score(game: &Game, plan: &QueryPlan) -> f64 {
    let mut score = 0.0;
    let rating_match = plan
        .rating
        .white_min
        .map(|min| game.white_rating.map(|r| r >= min).unwrap_or(false))
        .unwrap_or(false)
        || plan
            .rating
            .black_min
            .map(|min| game.black_rating.map(|r| r >= min).unwrap_or(false))
            .unwrap_or(false);
    if rating_match {
        score += 0.35;
    }
    let opening_match = plan.filters.iter().any(|f| {
        f.field == "opening" && game.opening_slug.as_deref() == Some(f.value.as_str())
    });
    if opening_match {
        score += 0.3;
    }
    score.min(0.65)
}

/// Collapses raw vector hits onto one entry per `game_id`: the maximum
/// score wins, and phase/theme/keyword payloads are unioned.
fn collapse_vector_hits(hits: Vec<VectorHit>) -> HashMap<i64, VectorHit> {
    let mut out: HashMap<i64, VectorHit> = HashMap::new();
    for hit in hits {
        out.entry(hit.game_id)
            .and_modify(|existing| {
                if hit.score > existing.score {
                    existing.score = hit.score;
                }
                union_into(&mut existing.phases, &hit.phases);
                union_into(&mut existing.themes, &hit.themes);
                union_into(&mut existing.keywords, &hit.keywords);
            })
            .or_insert(hit);
    }
    out
}

fn union_into(dest: &mut Vec<String>, src: &[String]) {
    for item in src {
        if !dest.contains(item) {
            dest.push(item.clone());
        }
    }
}

/// `|plan.keywords ∩ (candidate.keywords ∪ metadata_terms)| / max(1, |plan.keywords|)`.
/// `candidate.keywords` comes from the vector hit payload; `metadata_terms`
/// is tokenised from the game's denormalised text fields.
fn keyword_score(game: &Game, vector_keywords: &[String], plan_keywords: &[String]) -> f64 {
    if plan_keywords.is_empty() {
        return 0.0;
    }
    let metadata_text = format!(
        "{} {} {} {}",
        game.white_name,
        game.black_name,
        game.opening_name.as_deref().unwrap_or(""),
        game.event.as_deref().unwrap_or("")
    )
    .to_lowercase();
    let metadata_terms: Vec<&str> = metadata_text.split_whitespace().collect();

    let candidate_terms: std::collections::HashSet<String> = vector_keywords
        .iter()
        .map(|k| k.to_lowercase())
        .chain(metadata_terms.iter().map(|t| t.to_string()))
        .collect();

    let hits = plan_keywords
        .iter()
        .filter(|k| {
            let k = k.to_lowercase();
            candidate_terms.contains(&k) || metadata_text.contains(&k)
        })
        .count();
    hits as f64 / plan_keywords.len() as f64
}

fn sanitized(e: &AppError) -> String {
    crate::sanitize::sanitize(&e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanFilter, RatingConstraint};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn game(id: i64) -> Game {
        Game {
            id,
            white_name: "Alice".to_string(),
            black_name: "Bob".to_string(),
            result: Some("1-0".to_string()),
            event: Some("Test Open".to_string()),
            site: None,
            round: None,
            played_on: None,
            eco_code: Some("B90".to_string()),
            opening_slug: Some("sicilian-defense".to_string()),
            opening_name: Some("Sicilian Defense".to_string()),
            white_rating: Some(2100),
            black_rating: Some(2050),
            pgn: Some("1. e4 c5".to_string()),
        }
    }

    fn plan() -> QueryPlan {
        QueryPlan {
            cleaned_text: "sicilian games".to_string(),
            filters: vec![PlanFilter {
                field: "opening".to_string(),
                value: "sicilian-defense".to_string(),
            }],
            rating: RatingConstraint::default(),
            keywords: vec!["sicilian".to_string()],
            limit: 10,
            offset: 0,
        }
    }

    struct MockGames(Vec<Game>);
    #[async_trait]
    impl GameStore for MockGames {
        async fn fetch_games(
            &self,
            _plan: &QueryPlan,
            _limit: i64,
            _offset: i64,
        ) -> Result<(Vec<Game>, i64), AppError> {
            Ok((self.0.clone(), self.0.len() as i64))
        }
        async fn fetch_game_pgns(
            &self,
            ids: &[i64],
        ) -> Result<HashMap<i64, String>, AppError> {
            Ok(ids.iter().map(|id| (*id, "1. e4 c5".to_string())).collect())
        }
    }

    struct MockVectors(Vec<VectorHit>);
    #[async_trait]
    impl VectorStore for MockVectors {
        async fn search(&self, _plan: &QueryPlan, _limit: i64) -> Result<Vec<VectorHit>, AppError> {
            Ok(self.0.clone())
        }
        async fn upsert_points(
            &self,
            _points: Vec<crate::vector_store::VectorPoint>,
        ) -> Result<(), AppError> {
            Ok(())
        }
        async fn health(&self) -> Result<(), AppError> {
            Ok(())
        }
        async fn snapshot(&self) -> Result<String, AppError> {
            Ok("mock-snapshot".to_string())
        }
        async fn restore(&self, _snapshot_name: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn list_snapshots(&self) -> Result<Vec<String>, AppError> {
            Ok(Vec::new())
        }
    }

    struct FailingVectors;
    #[async_trait]
    impl VectorStore for FailingVectors {
        async fn search(&self, _plan: &QueryPlan, _limit: i64) -> Result<Vec<VectorHit>, AppError> {
            Err(AppError::UpstreamUnavailable("qdrant down".to_string()))
        }
        async fn upsert_points(
            &self,
            _points: Vec<crate::vector_store::VectorPoint>,
        ) -> Result<(), AppError> {
            Ok(())
        }
        async fn health(&self) -> Result<(), AppError> {
            Ok(())
        }
        async fn snapshot(&self) -> Result<String, AppError> {
            Err(AppError::UpstreamUnavailable("qdrant down".to_string()))
        }
        async fn restore(&self, _snapshot_name: &str) -> Result<(), AppError> {
            Err(AppError::UpstreamUnavailable("qdrant down".to_string()))
        }
        async fn list_snapshots(&self) -> Result<Vec<String>, AppError> {
            Err(AppError::UpstreamUnavailable("qdrant down".to_string()))
        }
    }

    fn base_executor(games: Vec<Game>, hits: Vec<VectorHit>) -> HybridExecutor {
        HybridExecutor {
            games: Arc::new(MockGames(games)),
            vectors: Arc::new(MockVectors(hits)),
            agent: None,
            agent_cache: None,
            circuit_breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
            config: HybridConfig::default(),
        }
    }

    #[tokio::test]
    async fn happy_path_merges_and_ranks() {
        let games = vec![game(1), game(2)];
        let hits = vec![VectorHit {
            game_id: 1,
            score: 0.9,
            phases: vec!["middlegame".to_string()],
            themes: vec![],
            keywords: vec![],
        }];
        let executor = base_executor(games, hits);
        let outcome = executor.execute(&plan()).await.unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].game_id, 1);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn empty_candidates_returns_empty_page() {
        let executor = base_executor(vec![], vec![]);
        let outcome = executor.execute(&plan()).await.unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.pagination.total, 0);
        assert!(!outcome.pagination.has_more);
    }

    #[tokio::test]
    async fn vector_failure_falls_back_to_keyword_only_with_warning() {
        let mut executor = base_executor(vec![game(1)], vec![]);
        executor.vectors = Arc::new(FailingVectors);
        let outcome = executor.execute(&plan()).await.unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.warnings.iter().any(|w| w.contains("vector search")));
    }

    #[tokio::test]
    async fn offset_beyond_total_yields_empty_page_with_correct_total() {
        let executor = base_executor(vec![game(1), game(2)], vec![]);
        let mut p = plan();
        p.offset = 100;
        let outcome = executor.execute(&p).await.unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.pagination.total, 2);
    }

    struct AlwaysAgreeingAgent;
    #[async_trait]
    impl AgentEvaluator for AlwaysAgreeingAgent {
        async fn evaluate(
            &self,
            _plan: &QueryPlan,
            candidates: &[(Game, String)],
            _deadline: Duration,
        ) -> Result<Vec<AgentEvaluation>, AppError> {
            Ok(candidates
                .iter()
                .map(|(g, _)| AgentEvaluation {
                    game_id: g.id,
                    score: if g.id == 2 { 1.0 } else { 0.0 },
                    explanation: Some("reorder".to_string()),
                    themes: vec![],
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn agent_can_reorder_candidates() {
        let mut executor = base_executor(vec![game(1), game(2)], vec![]);
        executor.agent = Some(Arc::new(AlwaysAgreeingAgent));
        let outcome = executor.execute(&plan()).await.unwrap();
        assert_eq!(outcome.results[0].game_id, 2);
        assert!(matches!(outcome.agent.status, AgentStatus::Enabled));
    }

    struct TimingOutAgent;
    #[async_trait]
    impl AgentEvaluator for TimingOutAgent {
        async fn evaluate(
            &self,
            _plan: &QueryPlan,
            _candidates: &[(Game, String)],
            _deadline: Duration,
        ) -> Result<Vec<AgentEvaluation>, AppError> {
            Err(AppError::Timeout("deadline exceeded".to_string()))
        }
    }

    #[tokio::test]
    async fn agent_timeout_falls_back_to_base_score_with_warning() {
        let mut executor = base_executor(vec![game(1)], vec![]);
        executor.agent = Some(Arc::new(TimingOutAgent));
        let outcome = executor.execute(&plan()).await.unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert!(matches!(outcome.agent.status, AgentStatus::Timeout));
        assert!(outcome.warnings.iter().any(|w| w.contains("agent timeout")));
    }

    struct FailingAgent(Mutex<u32>);
    #[async_trait]
    impl AgentEvaluator for FailingAgent {
        async fn evaluate(
            &self,
            _plan: &QueryPlan,
            _candidates: &[(Game, String)],
            _deadline: Duration,
        ) -> Result<Vec<AgentEvaluation>, AppError> {
            *self.0.lock().unwrap() += 1;
            Err(AppError::UpstreamUnavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn repeated_agent_failures_open_circuit_breaker() {
        let mut executor = base_executor(vec![game(1)], vec![]);
        executor.circuit_breaker = Arc::new(CircuitBreaker::new(2, Duration::from_secs(60)));
        executor.agent = Some(Arc::new(FailingAgent(Mutex::new(0))));

        executor.execute(&plan()).await.unwrap();
        executor.execute(&plan()).await.unwrap();
        let outcome = executor.execute(&plan()).await.unwrap();

        assert!(matches!(outcome.agent.status, AgentStatus::CircuitOpen));
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.contains("circuit breaker open")));
    }
}
