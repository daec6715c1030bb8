use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::dispatch::{Dispatcher, ReleaseGuard};
use crate::model::{Credential, RequestLog};

const FREQUENCY_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const CHANNEL_CAPACITY: usize = 16;

pub fn is_sse_request(accept_header: &str) -> bool {
    accept_header.to_ascii_lowercase().contains("text/event-stream")
}

fn pylon_error_event(code: &str, message: &str) -> Bytes {
    let payload = json!({ "code": code, "message": message });
    Bytes::from(format!("event: pylon_error\ndata: {payload}\n\n"))
}

/// Runs the SSE streaming state machine (OPENING -> RELAYING -> FAIL|END) and
/// returns the downstream response immediately; the actual relay happens in a
/// spawned producer task feeding a bounded channel, so the idle timeout and
/// per-event frequency wait never block the HTTP response from being headed.
#[allow(clippy::too_many_arguments)]
pub async fn stream_sse_response(
    dispatcher: &Dispatcher,
    credential: &Credential,
    api_id: &str,
    method: &str,
    path: &str,
    query: &str,
    headers: HashMap<String, String>,
    body: Bytes,
    guard: ReleaseGuard,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    let upstream = dispatcher.upstream.clone();
    let limiter = dispatcher.limiter.clone();
    let recorder = dispatcher.recorder.clone();
    let idle_timeout = dispatcher.sse_idle_timeout;
    let credential_id = credential.id.clone();
    let api_id_owned = api_id.to_string();
    let method_owned = method.to_string();
    let path_owned = path.to_string();
    let query_owned = query.to_string();
    let request_time = Utc::now();
    let started_at = Instant::now();

    tokio::spawn(async move {
        let mut guard = guard;
        let mut message_count: u32 = 0;
        let status = run_producer(
            &upstream,
            &limiter,
            &method_owned,
            &path_owned,
            &headers,
            &query_owned,
            body,
            &credential_id,
            &api_id_owned,
            idle_timeout,
            &tx,
            &mut message_count,
        )
        .await;

        limiter.release(&credential_id, &api_id_owned, true).await;
        guard.disarm();
        drop(guard);

        recorder
            .record(RequestLog {
                api_key_id: credential_id,
                api_identifier: api_id_owned,
                method: method_owned,
                path: path_owned,
                response_status: status,
                request_time,
                response_time_ms: started_at.elapsed().as_millis() as u64,
                client_ip: "unknown".to_string(),
                is_sse: true,
                sse_message_count: message_count,
            })
            .await;
    });

    Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, std::io::Error>)))
        .expect("static headers always build a valid response")
}

#[allow(clippy::too_many_arguments)]
async fn run_producer(
    upstream: &crate::upstream::UpstreamClient,
    limiter: &crate::ratelimit::RateLimiter,
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    query: &str,
    body: Bytes,
    user_id: &str,
    api_id: &str,
    idle_timeout: Duration,
    tx: &tokio::sync::mpsc::Sender<Bytes>,
    message_count: &mut u32,
) -> u16 {
    let (status, _resp_headers, mut chunks) = match upstream.send_stream(method, path, headers, query, body).await {
        Ok(v) => v,
        Err(err) => {
            let _ = tx.send(pylon_error_event("stream_error", &err.to_string())).await;
            return 502;
        }
    };

    if status >= 400 {
        let _ = tx
            .send(pylon_error_event("downstream_error", &format!("upstream returned status {status}")))
            .await;
        return status;
    }

    loop {
        let next = tokio::time::timeout(idle_timeout, chunks.next()).await;
        let chunk = match next {
            Err(_) => {
                let _ = tx.send(pylon_error_event("idle_timeout", "no data received within idle timeout")).await;
                return status;
            }
            Ok(None) => return status,
            Ok(Some(Err(err))) => {
                let _ = tx.send(pylon_error_event("stream_error", &err.to_string())).await;
                return status;
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        if chunk.is_empty() {
            continue;
        }

        let data_events = count_data_events(&chunk);
        let mut admitted = true;
        for _ in 0..data_events {
            let decision = limiter.increment_and_check_frequency(user_id, api_id).await;
            if decision.is_allowed() {
                *message_count += 1;
                continue;
            }
            if limiter.wait_for_frequency_slot(user_id, api_id, FREQUENCY_WAIT_TIMEOUT).await {
                *message_count += 1;
                continue;
            }
            let _ = tx
                .send(pylon_error_event("rate_limit_timeout", "rate limit wait timed out"))
                .await;
            admitted = false;
            break;
        }
        if !admitted {
            return status;
        }

        if tx.send(chunk).await.is_err() {
            // Downstream client disconnected; stop relaying but still run cleanup.
            warn!("sse consumer dropped, stopping relay");
            return status;
        }
    }
}

/// Counts occurrences of the literal substring `"data:"` in a chunk. A chunk
/// boundary landing mid-word can over-count; this is the accepted failure
/// mode (biased safe: over-counts reduce throughput, never increase it).
fn count_data_events(chunk: &[u8]) -> usize {
    let needle = b"data:";
    if chunk.len() < needle.len() {
        return 0;
    }
    chunk.windows(needle.len()).filter(|w| *w == needle).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_literal_data_colon_occurrences() {
        let chunk = b"event: x\ndata: hi\n\ndata: there\n\n";
        assert_eq!(count_data_events(chunk), 2);
    }

    #[test]
    fn empty_chunk_counts_zero() {
        assert_eq!(count_data_events(b""), 0);
    }

    #[test]
    fn is_sse_request_matches_event_stream_accept_case_insensitively() {
        assert!(is_sse_request("Text/Event-Stream"));
        assert!(is_sse_request("application/json, text/event-stream"));
        assert!(!is_sse_request("application/json"));
    }

    #[test]
    fn pylon_error_event_has_exact_framing() {
        let event = pylon_error_event("idle_timeout", "no data");
        let text = String::from_utf8(event.to_vec()).unwrap();
        assert!(text.starts_with("event: pylon_error\ndata: "));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"code\":\"idle_timeout\""));
    }
}
