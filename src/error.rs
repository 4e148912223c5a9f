//! The fixed error-kind taxonomy used across the query service and worker.
//!
//! Every variant maps to exactly one HTTP status and one stable `code`
//! string for the `{error: {code, message}}` response body. Messages are
//! sanitised before they cross a trust boundary (HTTP response or log line).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::sanitize::sanitize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream throttled: {0}")]
    UpstreamThrottled(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("policy violation: {0}")]
    PolicyViolation { message: String, retry_after: Option<u64> },

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::UpstreamThrottled(_) => "upstream_throttled",
            AppError::Timeout(_) => "timeout",
            AppError::SchemaViolation(_) => "schema_violation",
            AppError::PolicyViolation { .. } => "policy_violation",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::Fatal(_) => "fatal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamThrottled(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::SchemaViolation(_) => StatusCode::BAD_GATEWAY,
            AppError::PolicyViolation { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            AppError::PolicyViolation { retry_after, .. } => *retry_after,
            _ => None,
        };
        let message = sanitize(&self.to_string());
        let body = ErrorBody {
            error: ErrorDetail { code: self.code(), message },
        };
        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert("Retry-After", secs.to_string().parse().unwrap());
        }
        response
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
            other => AppError::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AppError::Timeout(e.to_string())
        } else if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            AppError::UpstreamThrottled(e.to_string())
        } else {
            AppError::UpstreamUnavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::SchemaViolation(e.to_string())
    }
}
