use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::verify_password;
use crate::model::{Credential, Priority, RateLimitRule};
use crate::ratelimit::RateLimiter;
use crate::store::SqliteStore;
use crate::upstream::UpstreamClient;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Verifies the configured admin password against a bcrypt hash and
/// issues/validates HS256 bearer sessions for the admin port.
pub struct AdminAuth {
    password_hash: String,
    jwt_secret: String,
    jwt_expire_hours: i64,
}

impl AdminAuth {
    pub fn new(password_hash: String, jwt_secret: String, jwt_expire_hours: i64) -> Self {
        Self { password_hash, jwt_secret, jwt_expire_hours }
    }

    pub fn authenticate(&self, password: &str) -> Option<String> {
        if !verify_password(password, &self.password_hash) {
            return None;
        }
        let now = Utc::now();
        let claims = Claims {
            sub: "admin".to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::hours(self.jwt_expire_hours)).timestamp(),
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .ok()
    }

    pub fn verify(&self, token: &str) -> bool {
        jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .is_ok()
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub auth: Arc<AdminAuth>,
    pub store: Arc<SqliteStore>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
}

pub fn router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/admin/credentials", get(list_credentials).post(create_credential))
        .route(
            "/admin/credentials/{id}",
            get(get_credential).patch(patch_credential).delete(delete_credential),
        )
        .route("/admin/credentials/{id}/revoke", post(revoke_credential))
        .route("/admin/credentials/{id}/refresh", post(refresh_credential))
        .route("/admin/stats", get(stats))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_session));

    Router::new()
        .route("/admin/login", post(login))
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn require_admin_session(
    State(state): State<AdminState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(crate::crypto::extract_bearer_token);

    match token {
        Some(token) if state.auth.verify(token) => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, Json(ErrorBody { error: "unauthorized" })).into_response(),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
}

async fn login(State(state): State<AdminState>, Json(body): Json<LoginRequest>) -> Response {
    match state.auth.authenticate(&body.password) {
        Some(token) => Json(LoginResponse { token }).into_response(),
        None => (StatusCode::UNAUTHORIZED, Json(ErrorBody { error: "unauthorized" })).into_response(),
    }
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    include_revoked: bool,
    #[serde(default)]
    include_expired: bool,
}

async fn list_credentials(State(state): State<AdminState>, Query(q): Query<ListQuery>) -> Response {
    match state.store.list(q.include_revoked, q.include_expired).await {
        Ok(credentials) => Json(credentials).into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Deserialize)]
struct CreateCredentialRequest {
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    expires_in_days: Option<i64>,
    #[serde(default)]
    rate_limit_override: Option<RateLimitRule>,
}

#[derive(Serialize)]
struct CreateCredentialResponse {
    token: String,
    #[serde(flatten)]
    credential: Credential,
}

async fn create_credential(State(state): State<AdminState>, Json(body): Json<CreateCredentialRequest>) -> Response {
    match state
        .store
        .create(body.description, body.priority, body.expires_in_days, body.rate_limit_override)
        .await
    {
        Ok((token, credential)) => {
            (StatusCode::CREATED, Json(CreateCredentialResponse { token, credential })).into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn get_credential(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.store.get(&id).await {
        Ok(Some(credential)) => Json(credential).into_response(),
        Ok(None) => not_found(),
        Err(err) => internal_error(err),
    }
}

#[derive(Deserialize, Default)]
struct PatchCredentialRequest {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default, deserialize_with = "deserialize_some")]
    expires_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    rate_limit_override: Option<Option<RateLimitRule>>,
}

/// Distinguishes "field absent" from "field present with value null", so a
/// PATCH can explicitly clear `expires_at`/`rate_limit_override`.
fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

async fn patch_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<PatchCredentialRequest>,
) -> Response {
    let has_rule_change = body.rate_limit_override.is_some();
    match state
        .store
        .update(&id, body.description, body.priority, body.expires_at, body.rate_limit_override)
        .await
    {
        Ok(Some(credential)) => {
            if has_rule_change {
                state.limiter.invalidate_user_rule(&id).await;
            }
            Json(credential).into_response()
        }
        Ok(None) => not_found(),
        Err(err) => internal_error(err),
    }
}

async fn revoke_credential(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.store.revoke(&id).await {
        Ok(Some(credential)) => {
            state.limiter.invalidate_user_rule(&id).await;
            Json(credential).into_response()
        }
        Ok(None) => not_found(),
        Err(err) => internal_error(err),
    }
}

#[derive(Serialize)]
struct RefreshResponse {
    token: String,
    #[serde(flatten)]
    credential: Credential,
}

async fn refresh_credential(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.store.refresh(&id).await {
        Ok(Some((token, credential))) => Json(RefreshResponse { token, credential }).into_response(),
        Ok(None) => not_found(),
        Err(err) => internal_error(err),
    }
}

async fn delete_credential(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.store.delete(&id).await {
        Ok(true) => {
            state.limiter.invalidate_user_rule(&id).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => not_found(),
        Err(err) => internal_error(err),
    }
}

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
    #[serde(default)]
    api_key_id: Option<String>,
    #[serde(default)]
    api_identifier: Option<String>,
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

async fn stats(State(state): State<AdminState>, Query(q): Query<StatsQuery>) -> Response {
    let start = match q.start.as_deref() {
        Some(s) => match parse_rfc3339(s) {
            Some(t) => Some(t),
            None => return bad_request("start must be RFC 3339"),
        },
        None => None,
    };
    let end = match q.end.as_deref() {
        Some(s) => match parse_rfc3339(s) {
            Some(t) => Some(t),
            None => return bad_request("end must be RFC 3339"),
        },
        None => None,
    };

    let credential_counts = match state.store.counts().await {
        Ok(c) => c,
        Err(err) => return internal_error(err),
    };
    let usage = match state.store.usage_stats(start, end, q.api_key_id, q.api_identifier).await {
        Ok(u) => u,
        Err(err) => return internal_error(err),
    };
    let limiter_stats = state.limiter.stats().await;
    Json(serde_json::json!({
        "credentials": credential_counts,
        "usage": usage,
        "limiter": limiter_stats,
    }))
    .into_response()
}

async fn health(State(state): State<AdminState>) -> Response {
    let downstream_ok = state.upstream.health_check().await;
    let limiter_stats = state.limiter.stats().await;
    Json(serde_json::json!({
        "status": "ok",
        "downstream": if downstream_ok { "reachable" } else { "unreachable" },
        "queue_size": limiter_stats.queue_size,
        "active_connections": limiter_stats.global_concurrent,
    }))
    .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: "not_found" })).into_response()
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message })).into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "admin API request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: "internal_error" })).into_response()
}
