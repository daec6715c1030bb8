use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::any;
use axum::Router;
use pylon::admin::{self, AdminAuth, AdminState};
use pylon::dispatch::Dispatcher;
use pylon::model::{Priority, RateLimitRule};
use pylon::queue::{QueueConfig, RequestQueue};
use pylon::ratelimit::{RateLimitConfig, RateLimiter};
use pylon::recorder::Recorder;
use pylon::store::{SqliteStore, StoreBackedRuleLoader};
use pylon::upstream::UpstreamClient;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    proxy_addr: SocketAddr,
    admin_addr: SocketAddr,
    store: Arc<SqliteStore>,
    limiter: Arc<RateLimiter>,
    raw_token: String,
    credential_id: String,
    client: reqwest::Client,
}

async fn spawn_harness(rate_limit: RateLimitConfig, queue_configured: bool) -> Harness {
    let store = Arc::new(SqliteStore::open(":memory:").expect("open in-memory sqlite"));
    let (raw_token, credential) = store
        .create("test credential".to_string(), Priority::Normal, None, None)
        .await
        .expect("create credential");

    let rule_loader = Box::new(StoreBackedRuleLoader { store: store.clone() });
    let limiter = RateLimiter::new(rate_limit, queue_configured, rule_loader);
    if queue_configured {
        let queue = RequestQueue::new(QueueConfig { max_size: 10, timeout: Duration::from_millis(200) }, limiter.clone());
        limiter.attach_queue(queue);
    }

    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .mount(&mock_server)
        .await;

    let upstream = Arc::new(
        UpstreamClient::new(mock_server.uri(), Duration::from_secs(5)).expect("build upstream client"),
    );
    let recorder = Arc::new(Recorder::new(store.clone()));

    let dispatcher = Arc::new(Dispatcher {
        credentials: store.clone(),
        limiter: limiter.clone(),
        upstream: upstream.clone(),
        recorder,
        sse_idle_timeout: Duration::from_secs(5),
    });

    let proxy_router = Router::new().fallback(any(Dispatcher::handle)).with_state(dispatcher);
    let proxy_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(proxy_listener, proxy_router).await.unwrap();
    });

    let admin_auth = Arc::new(AdminAuth::new(
        pylon::crypto::hash_password("admin-pw").unwrap(),
        "test-jwt-secret".to_string(),
        1,
    ));
    let admin_router = admin::router(AdminState {
        auth: admin_auth,
        store: store.clone(),
        limiter: limiter.clone(),
        upstream: upstream.clone(),
    });
    let admin_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = admin_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(admin_listener, admin_router).await.unwrap();
    });

    // Give both servers a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(20)).await;

    Harness {
        proxy_addr,
        admin_addr,
        store,
        limiter,
        raw_token,
        credential_id: credential.id,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn unauthenticated_request_is_rejected() {
    let harness = spawn_harness(RateLimitConfig::default(), false).await;
    let resp = harness
        .client
        .get(format!("http://{}/v1/models", harness.proxy_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn valid_credential_proxies_to_upstream() {
    let harness = spawn_harness(RateLimitConfig::default(), false).await;
    let resp = harness
        .client
        .get(format!("http://{}/v1/models", harness.proxy_addr))
        .bearer_auth(&harness.raw_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("\"ok\":true"));
}

#[tokio::test]
async fn malformed_bearer_token_is_rejected() {
    let harness = spawn_harness(RateLimitConfig::default(), false).await;
    let resp = harness
        .client
        .get(format!("http://{}/v1/models", harness.proxy_addr))
        .bearer_auth("not-a-real-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn user_frequency_limit_returns_429() {
    let mut rate_limit = RateLimitConfig::default();
    rate_limit.default_user = RateLimitRule::new(Some(5), Some(1), Some(5));
    let harness = spawn_harness(rate_limit, false).await;

    let first = harness
        .client
        .get(format!("http://{}/v1/models", harness.proxy_addr))
        .bearer_auth(&harness.raw_token)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = harness
        .client
        .get(format!("http://{}/v1/models", harness.proxy_addr))
        .bearer_auth(&harness.raw_token)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 429);
}

#[tokio::test]
async fn global_saturation_without_queue_returns_429() {
    let mut rate_limit = RateLimitConfig::default();
    rate_limit.global = RateLimitRule::new(Some(0), Some(100), Some(100));
    let harness = spawn_harness(rate_limit, false).await;

    let resp = harness
        .client
        .get(format!("http://{}/v1/models", harness.proxy_addr))
        .bearer_auth(&harness.raw_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
}

#[tokio::test]
async fn global_saturation_with_queue_times_out_when_never_admitted() {
    let mut rate_limit = RateLimitConfig::default();
    rate_limit.global = RateLimitRule::new(Some(0), Some(100), Some(100));
    let harness = spawn_harness(rate_limit, true).await;

    let resp = harness
        .client
        .get(format!("http://{}/v1/models", harness.proxy_addr))
        .bearer_auth(&harness.raw_token)
        .send()
        .await
        .unwrap();
    // maxConcurrent is permanently 0, so the queue driver can never admit the
    // waiter; it must time out rather than hang.
    assert_eq!(resp.status(), 504);
}

#[tokio::test]
async fn admin_credential_crud_round_trip() {
    let harness = spawn_harness(RateLimitConfig::default(), false).await;
    let login = harness
        .client
        .post(format!("http://{}/admin/login", harness.admin_addr))
        .json(&serde_json::json!({ "password": "admin-pw" }))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), 200);
    let token: serde_json::Value = login.json().await.unwrap();
    let jwt = token["token"].as_str().unwrap().to_string();

    let created = harness
        .client
        .post(format!("http://{}/admin/credentials", harness.admin_addr))
        .bearer_auth(&jwt)
        .json(&serde_json::json!({ "description": "created in test" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created_body: serde_json::Value = created.json().await.unwrap();
    let id = created_body["id"].as_str().unwrap().to_string();
    assert!(created_body["token"].as_str().unwrap().starts_with("sk-"));

    let fetched = harness
        .client
        .get(format!("http://{}/admin/credentials/{}", harness.admin_addr, id))
        .bearer_auth(&jwt)
        .send()
        .await
        .unwrap();
    assert_eq!(fetched.status(), 200);

    let revoked = harness
        .client
        .post(format!("http://{}/admin/credentials/{}/revoke", harness.admin_addr, id))
        .bearer_auth(&jwt)
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), 200);

    let stored = harness.store.get(&id).await.unwrap().unwrap();
    assert!(stored.is_revoked());

    let deleted = harness
        .client
        .delete(format!("http://{}/admin/credentials/{}", harness.admin_addr, id))
        .bearer_auth(&jwt)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
    assert!(harness.store.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn admin_routes_reject_missing_or_bad_session() {
    let harness = spawn_harness(RateLimitConfig::default(), false).await;
    let resp = harness
        .client
        .get(format!("http://{}/admin/credentials", harness.admin_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = harness
        .client
        .get(format!("http://{}/admin/credentials", harness.admin_addr))
        .bearer_auth("garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn health_endpoint_reports_reachable_downstream() {
    let harness = spawn_harness(RateLimitConfig::default(), false).await;
    let resp = harness
        .client
        .get(format!("http://{}/health", harness.admin_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["downstream"], "reachable");
}

#[tokio::test]
async fn revoked_credential_can_no_longer_authenticate() {
    let harness = spawn_harness(RateLimitConfig::default(), false).await;
    harness.store.revoke(&harness.credential_id).await.unwrap();

    let resp = harness
        .client
        .get(format!("http://{}/v1/models", harness.proxy_addr))
        .bearer_auth(&harness.raw_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
