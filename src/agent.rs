//! LLM agent evaluator: turns candidate games into a prompt, calls the
//! model, and parses a strict JSON evaluation schema.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{AgentEvaluation, Game, QueryPlan};
use crate::retry::{retry_with_backoff, Clock, Outcome, RetryPolicy, TokioClock};

#[async_trait]
pub trait AgentEvaluator: Send + Sync {
    /// Evaluates `candidates` against `plan`, returning at most one
    /// [`AgentEvaluation`] per candidate. Implementations may return a
    /// strict subset of ids; callers must not assume full coverage.
    async fn evaluate(
        &self,
        plan: &QueryPlan,
        candidates: &[(Game, String)],
        deadline: Duration,
    ) -> Result<Vec<AgentEvaluation>, AppError>;
}

pub struct OpenAIAgentEvaluator {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAIAgentEvaluator {
    pub fn new(api_base: String, api_key: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            api_key,
            model,
        }
    }
}

#[derive(Deserialize)]
struct EvaluationEnvelope {
    evaluations: Vec<RawEvaluation>,
}

#[derive(Deserialize)]
struct RawEvaluation {
    game_id: i64,
    score: f64,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    themes: Vec<String>,
}

fn build_prompt(plan: &QueryPlan, candidates: &[(Game, String)]) -> String {
    let mut prompt = String::from(
        "You are evaluating chess games against a question. Return exactly a JSON object \
         {\"evaluations\": [{\"game_id\": int, \"score\": float in [0,1], \"explanation\"?: string, \
         \"themes\"?: [string]}...]}. Do not include any other text.\n\n",
    );
    prompt.push_str(&format!("Question: {}\n\n", plan.cleaned_text));
    for (game, pgn) in candidates {
        prompt.push_str(&format!(
            "Game {}: {} vs {} ({}). PGN:\n{}\n\n",
            game.id,
            game.white_name,
            game.black_name,
            game.result.as_deref().unwrap_or("*"),
            pgn
        ));
    }
    prompt
}

fn parse_evaluations(raw: &str) -> Result<Vec<AgentEvaluation>, AppError> {
    let envelope: EvaluationEnvelope = serde_json::from_str(raw)
        .map_err(|e| AppError::SchemaViolation(format!("invalid agent response: {e}")))?;

    let mut out = Vec::with_capacity(envelope.evaluations.len());
    for item in envelope.evaluations {
        if !(0.0..=1.0).contains(&item.score) {
            return Err(AppError::SchemaViolation(format!(
                "agent score out of range for game {}: {}",
                item.game_id, item.score
            )));
        }
        out.push(AgentEvaluation {
            game_id: item.game_id,
            score: item.score,
            explanation: item.explanation,
            themes: item.themes,
        });
    }
    Ok(out)
}

fn classify_agent_error(e: AppError) -> Outcome<AppError> {
    match e {
        AppError::UpstreamThrottled(_) | AppError::Timeout(_) => Outcome::Retry(e),
        AppError::UpstreamUnavailable(_) => Outcome::Retry(e),
        other => Outcome::Fatal(other),
    }
}

#[async_trait]
impl AgentEvaluator for OpenAIAgentEvaluator {
    async fn evaluate(
        &self,
        plan: &QueryPlan,
        candidates: &[(Game, String)],
        deadline: Duration,
    ) -> Result<Vec<AgentEvaluation>, AppError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = build_prompt(plan, candidates);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.2,
        };
        let clock = TokioClock;

        let call = async {
            retry_with_backoff(
                &policy,
                &clock,
                || {
                    call_chat_completion(
                        &self.client,
                        &self.api_base,
                        self.api_key.as_deref(),
                        &self.model,
                        &prompt,
                    )
                },
                classify_agent_error,
                |attempt, delay, err| {
                    tracing::warn!(attempt, ?delay, error = %err, "retrying agent call");
                },
            )
            .await
        };

        let raw = tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| AppError::Timeout("agent call exceeded deadline".to_string()))??;

        parse_evaluations(&raw)
    }
}

async fn call_chat_completion(
    client: &reqwest::Client,
    api_base: &str,
    api_key: Option<&str>,
    model: &str,
    prompt: &str,
) -> Result<String, AppError> {
    let api_key =
        api_key.ok_or_else(|| AppError::Validation("AGENT_API_KEY is required".to_string()))?;

    let resp = client
        .post(format!("{api_base}/chat/completions"))
        .bearer_auth(api_key)
        .json(&serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "response_format": {"type": "json_object"},
        }))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(if status.as_u16() == 429 || status.as_u16() == 408 {
            AppError::UpstreamThrottled(body)
        } else if status.is_server_error() {
            AppError::UpstreamUnavailable(body)
        } else {
            AppError::Validation(format!("agent request rejected ({status}): {body}"))
        });
    }

    let parsed: serde_json::Value = resp.json().await?;
    parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::SchemaViolation("agent response missing message content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_envelope() {
        let raw = r#"{"evaluations":[{"game_id":1,"score":0.9,"explanation":"strong attack","themes":["tactics"]}]}"#;
        let parsed = parse_evaluations(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].game_id, 1);
        assert_eq!(parsed[0].score, 0.9);
    }

    #[test]
    fn rejects_out_of_range_score() {
        let raw = r#"{"evaluations":[{"game_id":1,"score":1.5}]}"#;
        assert!(parse_evaluations(raw).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_evaluations("not json").is_err());
    }

    #[test]
    fn ignores_unknown_fields() {
        let raw = r#"{"evaluations":[{"game_id":1,"score":0.5,"unexpected_field":true}]}"#;
        let parsed = parse_evaluations(raw).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
