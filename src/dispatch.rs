use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::instrument;

use crate::classify;
use crate::crypto::extract_bearer_token;
use crate::error::PylonError;
use crate::model::{Credential, RequestLog};
use crate::queue::QueueResult;
use crate::ratelimit::{Decision, RateLimiter};
use crate::recorder::Recorder;
use crate::sse::{is_sse_request, stream_sse_response};
use crate::store::CredentialStore;
use crate::upstream::{strip_downstream_headers, UpstreamClient};

/// Holds every collaborator a proxied request needs. Constructed once at
/// startup and shared behind an `Arc`; routes are methods on it reached
/// through axum's `State` extractor rather than any module-level global.
pub struct Dispatcher {
    pub credentials: Arc<dyn CredentialStore>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
    pub recorder: Arc<Recorder>,
    pub sse_idle_timeout: Duration,
}

/// Releases the concurrency/SSE slot acquired on the way in, exactly once,
/// even if the request task is aborted mid-flight. Dropping this guard
/// without calling `disarm` still releases — cancellation must run the same
/// cleanup as success.
pub struct ReleaseGuard {
    limiter: Arc<RateLimiter>,
    user_id: String,
    api_id: String,
    is_sse: bool,
    armed: bool,
}

impl ReleaseGuard {
    fn new(limiter: Arc<RateLimiter>, user_id: String, api_id: String, is_sse: bool) -> Self {
        Self { limiter, user_id, api_id, is_sse, armed: true }
    }

    /// Prevents the `Drop` impl from double-releasing after an explicit
    /// release already ran on the happy path.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let limiter = self.limiter.clone();
        let user_id = std::mem::take(&mut self.user_id);
        let api_id = std::mem::take(&mut self.api_id);
        let is_sse = self.is_sse;
        tokio::spawn(async move {
            limiter.release(&user_id, &api_id, is_sse).await;
        });
    }
}

fn body_looks_like_stream_true(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

impl Dispatcher {
    #[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn handle(State(this): State<Arc<Dispatcher>>, req: Request) -> Response {
        match this.dispatch(req).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn dispatch(&self, req: Request) -> Result<Response, PylonError> {
        let started_at = Instant::now();
        let request_time = Utc::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let client_ip = client_ip_of(req.headers());

        let auth_header = req
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let token = extract_bearer_token(auth_header).ok_or(PylonError::Unauthorized)?;
        let credential = self.authenticate(token).await?;

        let api_id = classify::identify(&method, &path);
        let headers = header_map_to_hashmap(req.headers());
        let body = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .map_err(|_| PylonError::Misconfigured("failed to buffer request body"))?;

        let is_sse = is_sse_request(req_headers_accept(&headers)) || body_looks_like_stream_true(&body);

        let decision = self
            .limiter
            .check_with_path(&credential.id, &api_id, &method, &path, is_sse)
            .await;

        let mut skip_global_concurrent = false;
        match decision {
            Decision::Allowed => {}
            Decision::QueueRequired => {
                let queue = self
                    .limiter
                    .queue()
                    .ok_or(PylonError::Misconfigured("queue required but not configured"))?;
                match queue.enqueue(&credential.id, credential.priority).await {
                    QueueResult::Acquired => skip_global_concurrent = true,
                    QueueResult::Timeout => return Err(PylonError::QueueTimeout),
                    QueueResult::Preempted => return Err(PylonError::QueuePreempted),
                }
            }
            other => return Err(PylonError::RateLimited(other)),
        }

        self.limiter.acquire(&credential.id, &api_id, is_sse, skip_global_concurrent).await;
        let mut guard = ReleaseGuard::new(self.limiter.clone(), credential.id.clone(), api_id.clone(), is_sse);

        if is_sse {
            let response = stream_sse_response(self, &credential, &api_id, &method, &path, &query, headers, body, guard).await;
            return Ok(response);
        }

        let upstream_result = self.upstream.send(&method, &path, &headers, &query, body).await;
        guard.disarm();
        self.limiter.release(&credential.id, &api_id, is_sse).await;

        let elapsed = started_at.elapsed();
        match upstream_result {
            Ok(upstream) => {
                self.recorder
                    .record(RequestLog {
                        api_key_id: credential.id.clone(),
                        api_identifier: api_id,
                        method,
                        path,
                        response_status: upstream.status,
                        request_time,
                        response_time_ms: elapsed.as_millis() as u64,
                        client_ip,
                        is_sse: false,
                        sse_message_count: 0,
                    })
                    .await;

                let mut builder = Response::builder().status(upstream.status);
                for (k, v) in strip_downstream_headers(&upstream.headers) {
                    builder = builder.header(k, v);
                }
                Ok(builder.body(Body::from(upstream.body)).unwrap())
            }
            Err(err) => {
                self.recorder
                    .record(RequestLog {
                        api_key_id: credential.id.clone(),
                        api_identifier: api_id,
                        method,
                        path,
                        response_status: 502,
                        request_time,
                        response_time_ms: elapsed.as_millis() as u64,
                        client_ip,
                        is_sse: false,
                        sse_message_count: 0,
                    })
                    .await;
                Err(PylonError::Upstream(err))
            }
        }
    }

    async fn authenticate(&self, token: &str) -> Result<Credential, PylonError> {
        if !token.starts_with(crate::crypto::API_KEY_PREFIX) {
            return Err(PylonError::Unauthorized);
        }
        let hash = crate::crypto::hash_api_key(token);
        let credential = self
            .credentials
            .lookup_by_hash(&hash)
            .await
            .map_err(|_| PylonError::Unauthorized)?
            .ok_or(PylonError::Unauthorized)?;
        if !credential.is_valid() {
            return Err(PylonError::Unauthorized);
        }
        Ok(credential)
    }
}

fn client_ip_of(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_map_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect()
}

fn req_headers_accept(headers: &HashMap<String, String>) -> &str {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("accept"))
        .map(|(_, v)| v.as_str())
        .unwrap_or("")
}
