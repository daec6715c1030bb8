use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::ratelimit::Decision;

/// The single error type returned by the request-admission and dispatch path.
///
/// Every variant maps to exactly one downstream HTTP response via `IntoResponse`;
/// nothing on the hot path uses `anyhow` so that this mapping stays exhaustive.
#[derive(Debug, thiserror::Error)]
pub enum PylonError {
    #[error("missing or invalid credential")]
    Unauthorized,

    #[error("rate limited: {0}")]
    RateLimited(Decision),

    #[error("queue wait timed out")]
    QueueTimeout,

    #[error("preempted by higher priority request")]
    QueuePreempted,

    #[error("dispatcher misconfigured: {0}")]
    Misconfigured(&'static str),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for PylonError {
    fn into_response(self) -> Response {
        let (status, slug, message) = match &self {
            PylonError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string()),
            PylonError::RateLimited(decision) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                decision.message().to_string(),
            ),
            PylonError::QueueTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "gateway_timeout",
                "Queue wait timeout".to_string(),
            ),
            PylonError::QueuePreempted => (
                StatusCode::SERVICE_UNAVAILABLE,
                "preempted",
                "Request preempted by higher priority".to_string(),
            ),
            PylonError::Misconfigured(what) => {
                (StatusCode::SERVICE_UNAVAILABLE, "misconfigured", what.to_string())
            }
            PylonError::Upstream(err) => {
                let status = if err.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, "upstream_error", err.to_string())
            }
        };

        (status, Json(ErrorBody { error: slug, message })).into_response()
    }
}

/// Startup / admin-CLI errors that are not on the per-request path use `anyhow`
/// directly at the call site; this alias documents the convention.
pub type StartupResult<T> = anyhow::Result<T>;
