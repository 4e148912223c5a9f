//! Intent analysis: turns free-text questions into a typed [`QueryPlan`].
//!
//! `analyse` is a pure function — no I/O, no fallible paths. Ambiguous or
//! unparseable input simply yields a plan with fewer filters; the analyser
//! never fails.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{PlanFilter, QueryPlan, RatingConstraint};
use crate::opening_catalogue::OpeningCatalogue;

const DEFAULT_LIMIT: i64 = 50;
const MIN_LIMIT: i64 = 1;
const MAX_LIMIT: i64 = 500;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "where", "show", "me", "find", "give", "return",
    "top", "first", "games", "game", "with", "that", "and", "or", "of", "in", "on", "for", "to",
    "at", "least", "rated", "above", "over", "points", "lower", "apart", "delta", "gap", "white",
    "black", "wins", "win", "draw", "drawn", "highlight",
];

const PHASES: &[&str] = &["endgame", "middlegame", "opening_phase"];
const THEMES: &[&str] = &["queenside_majority", "kingside_attack", "tactics", "sacrifice"];

static LIMIT_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:top|first|show|find|give|return)\s+(\d{1,4})\b").unwrap());
static LIMIT_TRAILING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,4})\s+games\b").unwrap());

static WHITE_MIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bwhite\s+(?:is\s+)?(?:rated\s+)?(?:at least|>=|above|over)?\s*(\d{3,4})\b")
        .unwrap()
});
static BLACK_MIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bblack\s+(?:is\s+)?(?:rated\s+)?(?:at least|>=|above|over)?\s*(\d{3,4})\b")
        .unwrap()
});
static RATING_DELTA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,4})\s+points?\s+(?:lower|apart|delta|gap)\b").unwrap());
static PLUS_RATING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(white|black)\D{0,10}?(\d{3,4})\+").unwrap()
});

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub fn analyse(
    text: &str,
    requested_limit: Option<i64>,
    requested_offset: Option<i64>,
    catalogue: &dyn OpeningCatalogue,
) -> QueryPlan {
    let lower = text.to_lowercase();
    let cleaned_text = WHITESPACE.replace_all(lower.trim(), " ").to_string();

    let limit = extract_limit(&cleaned_text, requested_limit);
    let offset = requested_offset.unwrap_or(0).max(0);

    let mut consumed: Vec<String> = Vec::new();
    let mut filters: Vec<PlanFilter> = Vec::new();

    let rating = extract_rating(&cleaned_text, &mut consumed);

    for hit in catalogue.matches(&cleaned_text) {
        filters.push(PlanFilter {
            field: "opening".to_string(),
            value: hit.slug.clone(),
        });
        if let Some((lo, hi)) = hit.eco_range {
            filters.push(PlanFilter {
                field: "eco_range".to_string(),
                value: format!("{lo}-{hi}"),
            });
        }
        consumed.push(hit.slug.replace('-', " "));
    }

    if let Some(result) = extract_result(&cleaned_text) {
        filters.push(PlanFilter {
            field: "result".to_string(),
            value: result,
        });
    }

    for phase in PHASES {
        if cleaned_text.contains(&phase.replace('_', " ")) || cleaned_text.contains(phase) {
            filters.push(PlanFilter {
                field: "phase".to_string(),
                value: (*phase).to_string(),
            });
            consumed.push((*phase).to_string());
        }
    }
    for theme in THEMES {
        if cleaned_text.contains(&theme.replace('_', " ")) || cleaned_text.contains(theme) {
            filters.push(PlanFilter {
                field: "theme".to_string(),
                value: (*theme).to_string(),
            });
            consumed.push((*theme).to_string());
        }
    }

    let keywords = extract_keywords(&cleaned_text, &consumed);

    QueryPlan {
        cleaned_text,
        filters,
        rating,
        keywords,
        limit,
        offset,
    }
}

fn extract_limit(text: &str, requested: Option<i64>) -> i64 {
    let from_text = LIMIT_KEYWORD
        .captures(text)
        .or_else(|| LIMIT_TRAILING.captures(text))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok());

    let raw = from_text.or(requested).unwrap_or(DEFAULT_LIMIT);
    raw.clamp(MIN_LIMIT, MAX_LIMIT)
}

fn extract_rating(text: &str, consumed: &mut Vec<String>) -> RatingConstraint {
    let mut rating = RatingConstraint::default();

    if let Some(c) = WHITE_MIN.captures(text) {
        if let Ok(v) = c[1].parse() {
            rating.white_min = Some(v);
            consumed.push(c[1].to_string());
        }
    }
    if let Some(c) = BLACK_MIN.captures(text) {
        if let Ok(v) = c[1].parse() {
            rating.black_min = Some(v);
            consumed.push(c[1].to_string());
        }
    }
    if let Some(c) = RATING_DELTA.captures(text) {
        if let Ok(v) = c[1].parse() {
            rating.max_rating_delta = Some(v);
            consumed.push(c[1].to_string());
        }
    }
    if let Some(c) = PLUS_RATING.captures(text) {
        if let Ok(v) = c[2].parse::<i32>() {
            match &c[1] {
                "white" => rating.white_min.get_or_insert(v),
                _ => rating.black_min.get_or_insert(v),
            };
            consumed.push(c[2].to_string());
        }
    }

    rating
}

fn extract_result(text: &str) -> Option<String> {
    if text.contains("draw") || text.contains("drawn") {
        Some("1/2-1/2".to_string())
    } else if text.contains("white wins") || text.contains("1-0") {
        Some("1-0".to_string())
    } else if text.contains("black wins") || text.contains("0-1") {
        Some("0-1".to_string())
    } else {
        None
    }
}

fn extract_keywords(text: &str, consumed: &[String]) -> Vec<String> {
    let consumed_set: std::collections::HashSet<&str> =
        consumed.iter().map(|s| s.as_str()).collect();

    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();
    for token in NON_ALNUM.split(text) {
        if token.is_empty() {
            continue;
        }
        if STOPWORDS.contains(&token) {
            continue;
        }
        if consumed_set.contains(token) {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if seen.insert(token.to_string()) {
            keywords.push(token.to_string());
        }
    }
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opening_catalogue::StaticOpeningCatalogue;

    fn plan(text: &str) -> QueryPlan {
        analyse(text, None, None, &StaticOpeningCatalogue)
    }

    #[test]
    fn limit_defaults_to_fifty() {
        let p = plan("show me endgame tactics");
        assert_eq!(p.limit, 50);
    }

    #[test]
    fn limit_keyword_extracted_and_clamped() {
        let p = plan("top 10000 games");
        assert_eq!(p.limit, MAX_LIMIT);
    }

    #[test]
    fn limit_from_trailing_pattern() {
        let p = plan("20 games with sacrifices");
        assert_eq!(p.limit, 20);
    }

    #[test]
    fn offset_non_negative() {
        let p = analyse("anything", None, Some(-5), &StaticOpeningCatalogue);
        assert_eq!(p.offset, 0);
    }

    #[test]
    fn extracts_rating_and_opening_and_result() {
        let p = plan(
            "Show me King's Indian games where white is rated at least 2800 and highlight middlegame tactics",
        );
        assert_eq!(p.rating.white_min, Some(2800));
        assert!(p.filters.iter().any(|f| f.field == "opening" && f.value == "kings-indian"));
        assert!(p.filters.iter().any(|f| f.field == "eco_range"));
        assert!(p.filters.iter().any(|f| f.field == "phase" && f.value == "middlegame"));
        assert!(p.filters.iter().any(|f| f.field == "theme" && f.value == "tactics"));
    }

    #[test]
    fn draw_result_filter() {
        let p = plan("find drawn games in the sicilian");
        assert!(p.filters.iter().any(|f| f.field == "result" && f.value == "1/2-1/2"));
    }

    #[test]
    fn never_fails_on_empty_input() {
        let p = plan("");
        assert_eq!(p.limit, 50);
        assert_eq!(p.offset, 0);
        assert!(p.filters.is_empty());
    }

    #[test]
    fn filter_order_is_stable() {
        let p1 = plan("king's indian games that are drawn in the middlegame");
        let p2 = plan("king's indian games that are drawn in the middlegame");
        assert_eq!(
            p1.filters.iter().map(|f| (&f.field, &f.value)).collect::<Vec<_>>(),
            p2.filters.iter().map(|f| (&f.field, &f.value)).collect::<Vec<_>>()
        );
    }
}
