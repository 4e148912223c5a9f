//! Database schema migrations.
//!
//! Creates the `games`, `positions`, and `embedding_jobs` tables (§3) and
//! their supporting indexes, idempotently. Designed to be run via
//! `chessmate init` before the server or worker starts.

use anyhow::Result;
use sqlx::PgPool;

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS games (
            id BIGSERIAL PRIMARY KEY,
            white_name TEXT NOT NULL,
            black_name TEXT NOT NULL,
            result TEXT,
            event TEXT,
            site TEXT,
            round TEXT,
            played_on DATE,
            eco_code TEXT,
            opening_slug TEXT,
            opening_name TEXT,
            white_rating INTEGER,
            black_rating INTEGER,
            pgn TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            game_id BIGINT NOT NULL REFERENCES games(id),
            ply INTEGER NOT NULL,
            san TEXT NOT NULL,
            fen TEXT NOT NULL,
            side_to_move CHAR(1) NOT NULL,
            vector_id TEXT,
            PRIMARY KEY (game_id, ply)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_jobs (
            id BIGSERIAL PRIMARY KEY,
            game_id BIGINT NOT NULL,
            ply INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            fen TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            FOREIGN KEY (game_id, ply) REFERENCES positions(game_id, ply)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_opening_slug ON games(opening_slug)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_eco_code ON games(eco_code)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_played_on ON games(played_on DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embedding_jobs_status_enqueued \
         ON embedding_jobs(status, enqueued_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embedding_jobs_started_at \
         ON embedding_jobs(started_at) WHERE status = 'in_progress'",
    )
    .execute(pool)
    .await?;

    Ok(())
}
