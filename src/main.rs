use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::any;
use axum::Router;
use clap::Parser;
use tokio::task::JoinSet;
use tracing::info;

use pylon::admin::{self, AdminAuth, AdminState};
use pylon::config::Config;
use pylon::dispatch::Dispatcher;
use pylon::queue::RequestQueue;
use pylon::ratelimit::RateLimiter;
use pylon::recorder::Recorder;
use pylon::store::{run_retention_sweeper, SqliteStore, StoreBackedRuleLoader};
use pylon::upstream::UpstreamClient;

#[derive(Parser, Debug)]
#[command(version, about = "Pylon: a rate-limiting reverse proxy gateway", long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, value_name = "file", default_value = "pylon.yaml")]
    config: String,

    /// Overrides `server.proxyPort` from the config file.
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Overrides `server.adminPort` from the config file.
    #[arg(long)]
    admin_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(&args.config).context("loading configuration")?;
    if let Some(port) = args.proxy_port {
        config.server.proxy_port = port;
    }
    if let Some(port) = args.admin_port {
        config.server.admin_port = port;
    }

    pylon::telemetry::init(&config.logging.level);

    let store = Arc::new(SqliteStore::open(&config.database.path).context("opening sqlite store")?);

    let rule_loader = Box::new(StoreBackedRuleLoader { store: store.clone() });
    let queue_configured = config.queue.max_size > 0;
    let limiter = RateLimiter::new(config.rate_limit.clone().into_core_config(), queue_configured, rule_loader);

    if queue_configured {
        let queue = RequestQueue::new(config.queue.clone().into_core_config(), limiter.clone());
        limiter.attach_queue(queue);
    }

    let upstream = Arc::new(
        UpstreamClient::new(config.downstream.base_url.clone(), Duration::from_secs(config.downstream.timeout))
            .context("building upstream client")?,
    );
    let recorder = Arc::new(Recorder::new(store.clone()));

    let dispatcher = Arc::new(Dispatcher {
        credentials: store.clone(),
        limiter: limiter.clone(),
        upstream: upstream.clone(),
        recorder,
        sse_idle_timeout: Duration::from_secs(config.sse.idle_timeout),
    });

    let proxy_router = Router::new().fallback(any(Dispatcher::handle)).with_state(dispatcher);

    let admin_auth = Arc::new(AdminAuth::new(
        config.admin.password_hash.clone(),
        config.admin.jwt_secret.clone(),
        config.admin.jwt_expire_hours,
    ));
    let admin_router = admin::router(AdminState {
        auth: admin_auth,
        store: store.clone(),
        limiter: limiter.clone(),
        upstream: upstream.clone(),
    });

    let mut tasks = JoinSet::new();

    let proxy_addr = format!("{}:{}", config.server.host, config.server.proxy_port);
    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .with_context(|| format!("binding proxy listener on {proxy_addr}"))?;
    info!(addr = %proxy_addr, "proxy listening");
    tasks.spawn(async move {
        axum::serve(proxy_listener, proxy_router).await.context("proxy server")
    });

    let admin_addr = format!("{}:{}", config.server.host, config.server.admin_port);
    let admin_listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .with_context(|| format!("binding admin listener on {admin_addr}"))?;
    info!(addr = %admin_addr, "admin api listening");
    tasks.spawn(async move {
        axum::serve(admin_listener, admin_router).await.context("admin server")
    });

    tasks.spawn(async move {
        run_retention_sweeper(store, config.data_retention.days, config.data_retention.cleanup_interval_hours).await;
        Ok(())
    });

    while let Some(result) = tasks.join_next().await {
        result??;
    }
    Ok(())
}
