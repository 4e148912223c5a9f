//! PGN ingestion: parses a PGN file (§Out of scope — parsing itself is
//! `crate::pgn`'s job), upserts each game into the relational store, and
//! enqueues one `pending` embedding job per position.
//!
//! Guarded by the queue-pressure check (§4.D "Queue-pressure guard"): when
//! `max_pending` is positive and the number of `pending` jobs already
//! exceeds it, ingestion refuses to enqueue more and returns
//! [`IngestOutcome::QueuePressure`] rather than growing the backlog further.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use sqlx::{PgPool, Row};

use crate::error::AppError;
use crate::pgn::{self, ParsedGame};
use crate::store::JobStore;

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub games_ingested: u64,
    pub positions_enqueued: u64,
    pub games_skipped: u64,
    pub warnings: Vec<String>,
}

pub enum IngestOutcome {
    Completed(IngestReport),
    QueuePressure { pending: i64, max_pending: i64 },
}

pub async fn ingest_pgn_file(
    pool: &PgPool,
    jobs: &dyn JobStore,
    path: &Path,
    max_pending: i64,
) -> Result<IngestOutcome, AppError> {
    if max_pending > 0 {
        let pending = jobs.count_pending().await?;
        if pending > max_pending {
            return Ok(IngestOutcome::QueuePressure { pending, max_pending });
        }
    }

    let file = File::open(path)
        .map_err(|e| AppError::Validation(format!("cannot open {}: {e}", path.display())))?;
    let mut warnings = Vec::new();
    let games = pgn::parse_pgn(BufReader::new(file), &mut warnings)?;

    let mut games_ingested = 0u64;
    let mut positions_enqueued = 0u64;
    let games_skipped = warnings.len() as u64;

    for game in &games {
        let game_id = upsert_game(pool, game).await?;
        let positions: Vec<(i32, String, String, char)> = game
            .positions
            .iter()
            .map(|p| (p.ply, p.san.clone(), p.fen.clone(), p.side_to_move))
            .collect();
        let enqueued = jobs.enqueue_positions(game_id, &positions).await?;
        positions_enqueued += enqueued as u64;
        games_ingested += 1;
    }

    Ok(IngestOutcome::Completed(IngestReport {
        games_ingested,
        positions_enqueued,
        games_skipped,
        warnings,
    }))
}

async fn upsert_game(pool: &PgPool, game: &ParsedGame) -> Result<i64, AppError> {
    let h = &game.headers;
    let white = h.get("White").cloned().unwrap_or_else(|| "Unknown".to_string());
    let black = h.get("Black").cloned().unwrap_or_else(|| "Unknown".to_string());
    let result = h.get("Result").filter(|r| r.as_str() != "*").cloned();
    let event = h.get("Event").cloned();
    let site = h.get("Site").cloned();
    let round = h.get("Round").cloned();
    let played_on = h.get("Date").and_then(|d| parse_pgn_date(d));
    let eco_code = h.get("ECO").cloned();
    let opening_name = h.get("Opening").cloned();
    let opening_slug = opening_name.as_deref().map(slugify);
    let white_rating = h.get("WhiteElo").and_then(|v| v.parse::<i32>().ok());
    let black_rating = h.get("BlackElo").and_then(|v| v.parse::<i32>().ok());
    let pgn_text = render_pgn(game);

    let row = sqlx::query(
        r#"
        INSERT INTO games (white_name, black_name, result, event, site, round, played_on,
                            eco_code, opening_slug, opening_name, white_rating, black_rating, pgn)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING id
        "#,
    )
    .bind(white)
    .bind(black)
    .bind(result)
    .bind(event)
    .bind(site)
    .bind(round)
    .bind(played_on)
    .bind(eco_code)
    .bind(opening_slug)
    .bind(opening_name)
    .bind(white_rating)
    .bind(black_rating)
    .bind(pgn_text)
    .fetch_one(pool)
    .await?;

    Ok(row.get("id"))
}

fn parse_pgn_date(raw: &str) -> Option<chrono::NaiveDate> {
    // PGN dates are `YYYY.MM.DD`, with `??` padding allowed for unknown
    // components. Treat any padded component as "unknown" and bail.
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let year = parts[0].parse::<i32>().ok()?;
    let month = parts[1].parse::<u32>().ok()?;
    let day = parts[2].parse::<u32>().ok()?;
    chrono::NaiveDate::from_ymd_opt(year, month, day)
}

fn slugify(name: &str) -> String {
    let lower = name.to_lowercase();
    let mut slug = String::with_capacity(lower.len());
    let mut last_dash = false;
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Reconstructs a minimal PGN text block from parsed headers and SAN moves,
/// since `pgn-reader`'s streaming visitor does not retain the original
/// bytes. Sufficient for the agent evaluator's prompt context (§4.C).
fn render_pgn(game: &ParsedGame) -> String {
    let mut out = String::new();
    for (key, value) in &game.headers {
        out.push_str(&format!("[{key} \"{value}\"]\n"));
    }
    out.push('\n');
    for (i, pos) in game.positions.iter().enumerate() {
        if pos.side_to_move == 'b' {
            // the ply that was just played was White's; number it
            out.push_str(&format!("{}. ", (i / 2) + 1));
        }
        out.push_str(&pos.san);
        out.push(' ');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("King's Indian Defense"), "king-s-indian-defense");
    }

    #[test]
    fn parse_pgn_date_valid() {
        assert_eq!(
            parse_pgn_date("2024.01.15"),
            chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
        );
    }

    #[test]
    fn parse_pgn_date_padded_is_none() {
        assert_eq!(parse_pgn_date("2024.??.??"), None);
    }
}
