//! The relational store: Postgres-backed games/positions/embedding-job
//! access, behind traits so the hybrid executor and the embedding worker can
//! be tested without a live database.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

use crate::error::AppError;
use crate::models::{EmbeddingJob, Game, JobStatus, QueryPlan};

#[async_trait]
pub trait GameStore: Send + Sync {
    /// Fetches up to `limit` candidate games matching `plan`'s filters and
    /// rating constraints, plus the total count of matching rows
    /// (independent of `limit`/`offset`) for pagination.
    async fn fetch_games(
        &self,
        plan: &QueryPlan,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Game>, i64), AppError>;

    /// Fetches full PGN text for the given game ids, keyed by id. Missing
    /// ids are simply absent from the returned map.
    async fn fetch_game_pgns(&self, ids: &[i64]) -> Result<HashMap<i64, String>, AppError>;
}

/// The embedding-job side of the relational store: claim protocol, batch
/// read of join data for the vector payload, and terminal-state transitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically claims up to `k` pending jobs (`FOR UPDATE SKIP LOCKED`),
    /// marking them `in_progress` and bumping `attempts`.
    async fn claim_jobs(&self, k: i64) -> Result<Vec<EmbeddingJob>, AppError>;

    /// Single joined read of the metadata needed for the vector payload
    /// (`game_id, ply, white, black, opening_slug, eco_code, phases, themes`)
    /// for a batch of positions, keyed by `(game_id, ply)`.
    async fn fetch_payload_metadata(
        &self,
        positions: &[(i64, i32)],
    ) -> Result<HashMap<(i64, i32), PositionMetadata>, AppError>;

    /// Terminal success transition: in one transaction, sets
    /// `positions.vector_id` and marks the job `completed`.
    async fn complete_job(&self, job_id: i64, vector_id: &str) -> Result<(), AppError>;

    /// Terminal failure transition after retries are exhausted.
    async fn fail_job(&self, job_id: i64, sanitised_error: &str) -> Result<(), AppError>;

    /// Count of rows still `pending`, used by the ingest queue-pressure guard.
    async fn count_pending(&self) -> Result<i64, AppError>;

    /// Enqueues one `pending` job per position for a freshly ingested game.
    async fn enqueue_positions(
        &self,
        game_id: i64,
        positions: &[(i32, String, String, char)],
    ) -> Result<i64, AppError>;

    /// Reactivates `in_progress` rows older than `grace` back to `pending`,
    /// returning the number reclaimed. Orphaned-job reconciliation (§9).
    async fn reclaim_stale(&self, grace: chrono::Duration) -> Result<i64, AppError>;
}

#[derive(Debug, Clone)]
pub struct PositionMetadata {
    pub game_id: i64,
    pub ply: i32,
    pub white: String,
    pub black: String,
    pub opening_slug: Option<String>,
    pub eco_code: Option<String>,
    pub phases: Vec<String>,
    pub themes: Vec<String>,
}

pub async fn connect(database_url: &str) -> Result<PgPool, AppError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(AppError::from)
}

pub struct PostgresGameStore {
    pool: PgPool,
}

impl PostgresGameStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl GameStore for PostgresGameStore {
    async fn fetch_games(
        &self,
        plan: &QueryPlan,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Game>, i64), AppError> {
        let mut conditions: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        for filter in &plan.filters {
            match filter.field.as_str() {
                "opening" => {
                    conditions.push(format!("opening_slug = ${}", binds.len() + 1));
                    binds.push(filter.value.clone());
                }
                "eco_range" => {
                    if let Some((lo, hi)) = filter.value.split_once('-') {
                        conditions.push(format!(
                            "eco_code BETWEEN ${} AND ${}",
                            binds.len() + 1,
                            binds.len() + 2
                        ));
                        binds.push(lo.to_string());
                        binds.push(hi.to_string());
                    }
                }
                "result" => {
                    conditions.push(format!("result = ${}", binds.len() + 1));
                    binds.push(filter.value.clone());
                }
                _ => {}
            }
        }

        let mut where_clause = if conditions.is_empty() {
            "TRUE".to_string()
        } else {
            conditions.join(" AND ")
        };

        if let Some(min) = plan.rating.white_min {
            where_clause.push_str(&format!(" AND white_rating >= {min}"));
        }
        if let Some(min) = plan.rating.black_min {
            where_clause.push_str(&format!(" AND black_rating >= {min}"));
        }
        if let Some(delta) = plan.rating.max_rating_delta {
            where_clause.push_str(&format!(
                " AND abs(white_rating - black_rating) <= {delta}"
            ));
        }

        let count_sql = format!("SELECT count(*) FROM games WHERE {where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for b in &binds {
            count_query = count_query.bind(b);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?;

        let limit_idx = binds.len() + 1;
        let offset_idx = binds.len() + 2;
        let select_sql = format!(
            "SELECT id, white_name, black_name, result, event, site, round, played_on, \
             eco_code, opening_slug, opening_name, white_rating, black_rating \
             FROM games WHERE {where_clause} \
             ORDER BY played_on DESC NULLS LAST, id ASC \
             LIMIT ${limit_idx} OFFSET ${offset_idx}"
        );
        let mut select_query = sqlx::query(&select_sql);
        for b in &binds {
            select_query = select_query.bind(b);
        }
        select_query = select_query.bind(limit).bind(offset);

        let rows = select_query.fetch_all(&self.pool).await?;
        let games = rows
            .into_iter()
            .map(|row| Game {
                id: row.get("id"),
                white_name: row.get("white_name"),
                black_name: row.get("black_name"),
                result: row.get("result"),
                event: row.get("event"),
                site: row.get("site"),
                round: row.get("round"),
                played_on: row.get("played_on"),
                eco_code: row.get("eco_code"),
                opening_slug: row.get("opening_slug"),
                opening_name: row.get("opening_name"),
                white_rating: row.get("white_rating"),
                black_rating: row.get("black_rating"),
                pgn: None,
            })
            .collect();

        Ok((games, total))
    }

    async fn fetch_game_pgns(&self, ids: &[i64]) -> Result<HashMap<i64, String>, AppError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT id, pgn FROM games WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<i64, _>("id"), row.get::<String, _>("pgn")))
            .collect())
    }
}

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn claim_jobs(&self, k: i64) -> Result<Vec<EmbeddingJob>, AppError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, game_id, ply, fen, attempts
            FROM embedding_jobs
            WHERE status = 'pending'
            ORDER BY enqueued_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(k)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>("id")).collect();
        let now = Utc::now();

        sqlx::query(
            "UPDATE embedding_jobs SET status = 'in_progress', started_at = $1, \
             attempts = attempts + 1 WHERE id = ANY($2)",
        )
        .bind(now)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|row| EmbeddingJob {
                id: row.get("id"),
                game_id: row.get("game_id"),
                ply: row.get("ply"),
                status: JobStatus::InProgress,
                fen: row.get("fen"),
                attempts: row.get::<i32, _>("attempts") + 1,
                last_error: None,
                enqueued_at: now,
                started_at: Some(now),
                completed_at: None,
            })
            .collect())
    }

    async fn fetch_payload_metadata(
        &self,
        positions: &[(i64, i32)],
    ) -> Result<HashMap<(i64, i32), PositionMetadata>, AppError> {
        if positions.is_empty() {
            return Ok(HashMap::new());
        }
        let game_ids: Vec<i64> = positions.iter().map(|(g, _)| *g).collect();

        let rows = sqlx::query(
            r#"
            SELECT p.game_id, p.ply, g.white_name, g.black_name,
                   g.opening_slug, g.eco_code
            FROM positions p
            JOIN games g ON g.id = p.game_id
            WHERE p.game_id = ANY($1)
            "#,
        )
        .bind(&game_ids)
        .fetch_all(&self.pool)
        .await?;

        let wanted: std::collections::HashSet<(i64, i32)> = positions.iter().copied().collect();
        let mut out = HashMap::new();
        for row in rows {
            let key = (row.get::<i64, _>("game_id"), row.get::<i32, _>("ply"));
            if !wanted.contains(&key) {
                continue;
            }
            out.insert(
                key,
                PositionMetadata {
                    game_id: key.0,
                    ply: key.1,
                    white: row.get("white_name"),
                    black: row.get("black_name"),
                    opening_slug: row.get("opening_slug"),
                    eco_code: row.get("eco_code"),
                    phases: Vec::new(),
                    themes: Vec::new(),
                },
            );
        }
        Ok(out)
    }

    async fn complete_job(&self, job_id: i64, vector_id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let job_row = sqlx::query("SELECT game_id, ply FROM embedding_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("embedding job {job_id}")))?;
        let game_id: i64 = job_row.get("game_id");
        let ply: i32 = job_row.get("ply");

        sqlx::query("UPDATE positions SET vector_id = $1 WHERE game_id = $2 AND ply = $3")
            .bind(vector_id)
            .bind(game_id)
            .bind(ply)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE embedding_jobs SET status = 'completed', completed_at = $1 WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: i64, sanitised_error: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE embedding_jobs SET status = 'failed', completed_at = $1, last_error = $2 \
             WHERE id = $3",
        )
        .bind(Utc::now())
        .bind(sanitised_error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_pending(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM embedding_jobs WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn enqueue_positions(
        &self,
        game_id: i64,
        positions: &[(i32, String, String, char)],
    ) -> Result<i64, AppError> {
        if positions.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for (ply, san, fen, side_to_move) in positions {
            sqlx::query(
                "INSERT INTO positions (game_id, ply, san, fen, side_to_move, vector_id) \
                 VALUES ($1, $2, $3, $4, $5, NULL) \
                 ON CONFLICT (game_id, ply) DO UPDATE SET san = excluded.san, fen = excluded.fen",
            )
            .bind(game_id)
            .bind(ply)
            .bind(san)
            .bind(fen)
            .bind(side_to_move.to_string())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO embedding_jobs (game_id, ply, fen, status, attempts, enqueued_at) \
                 VALUES ($1, $2, $3, 'pending', 0, $4)",
            )
            .bind(game_id)
            .bind(ply)
            .bind(fen)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(positions.len() as i64)
    }

    async fn reclaim_stale(&self, grace: chrono::Duration) -> Result<i64, AppError> {
        let cutoff = Utc::now() - grace;
        let result = sqlx::query(
            "UPDATE embedding_jobs SET status = 'pending', started_at = NULL \
             WHERE status = 'in_progress' AND started_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as i64)
    }
}
