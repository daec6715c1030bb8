use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use reqwest::{Client, Method};

/// Headers stripped (case-insensitively) before forwarding upstream.
const UPSTREAM_STRIP_HEADERS: &[&str] = &[
    "authorization",
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Headers stripped (case-insensitively) before relaying the upstream
/// response back downstream.
const DOWNSTREAM_STRIP_HEADERS: &[&str] =
    &["connection", "keep-alive", "transfer-encoding", "content-encoding"];

pub fn strip_upstream_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    strip(headers, UPSTREAM_STRIP_HEADERS)
}

pub fn strip_downstream_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    strip(headers, DOWNSTREAM_STRIP_HEADERS)
}

fn strip(headers: &HashMap<String, String>, deny: &[&str]) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(k, _)| !deny.iter().any(|d| d.eq_ignore_ascii_case(k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Thin wrapper around a shared `reqwest::Client` pointed at a single base
/// URL. Non-SSE calls carry the configured timeout; streaming calls do not,
/// since SSE forbids an overall-body deadline.
pub struct UpstreamClient {
    client: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn build_request(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        query: &str,
    ) -> anyhow::Result<reqwest::RequestBuilder> {
        let method = Method::from_bytes(method.as_bytes())?;
        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        let mut builder = self.client.request(method, url);
        for (k, v) in strip_upstream_headers(headers) {
            builder = builder.header(k, v);
        }
        Ok(builder)
    }

    pub async fn send(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        query: &str,
        body: Bytes,
    ) -> reqwest::Result<UpstreamResponse> {
        let request = self
            .build_request(method, path, headers, query)
            .expect("method/url always valid for a proxied request")
            .body(body);
        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().await?;
        Ok(UpstreamResponse { status, headers, body })
    }

    /// Opens a streaming request; returns the response status/headers plus a
    /// byte-chunk stream for the caller to drive with its own idle timeout.
    pub async fn send_stream(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        query: &str,
        body: Bytes,
    ) -> reqwest::Result<(u16, HashMap<String, String>, impl Stream<Item = reqwest::Result<Bytes>>)> {
        let request = self
            .build_request(method, path, headers, query)
            .expect("method/url always valid for a proxied request")
            .timeout(Duration::MAX)
            .body(body);
        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        Ok((status, headers, response.bytes_stream()))
    }

    pub async fn health_check(&self) -> bool {
        self.client
            .head(&self.base_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }
}
