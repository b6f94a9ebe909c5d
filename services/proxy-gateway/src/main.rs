//! Reverse proxy that fronts a pool of OAuth-authenticated upstream
//! accounts: terminates client connections, picks a healthy account,
//! forwards the request, and drives pool health transitions from the
//! observed outcome.

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;
mod service;
mod usage;

use std::sync::Arc;
use std::time::Instant;

use account_pool::Pool;
use account_store::TokenStore;
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use request_log::LogSink;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::proxy::DispatcherState;
use crate::service::Lifecycle;

#[derive(Clone)]
struct HealthState {
    lifecycle: Arc<Lifecycle>,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting proxy-gateway");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        enable_logging = config.proxy.enable_logging,
        "configuration loaded"
    );

    let metrics_handle = metrics::install_recorder();

    let http_client = reqwest::Client::new();
    let token_store = Arc::new(
        TokenStore::open(&config.proxy.home)
            .await
            .context("failed to open token store")?,
    );
    let pool = Arc::new(
        Pool::load(
            token_store,
            http_client.clone(),
            config.proxy.refresh_skew(),
            config.proxy.refresh_timeout(),
        )
        .await
        .context("failed to load account pool")?,
    );
    let log_sink = Arc::new(LogSink::new(
        config.proxy.enable_logging,
        config.proxy.max_logs,
    ));
    let lifecycle = Arc::new(Lifecycle::new(pool.clone(), config.proxy.drain_timeout()));

    let dispatcher_state = Arc::new(DispatcherState {
        pool: pool.clone(),
        log_sink,
        http_client: http_client.clone(),
        upstream_url: config.proxy.upstream_url.clone(),
        api_key: config.proxy.api_key_secret(),
        request_timeout: config.proxy.request_timeout(),
    });

    let health_state = HealthState {
        lifecycle: lifecycle.clone(),
        metrics_handle,
        started_at: Instant::now(),
    };

    let health_router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(health_state);
    let dispatcher_router = Router::new()
        .fallback(proxy::dispatch)
        .with_state(dispatcher_state);
    let app = health_router.merge(dispatcher_router);

    let admin_state = admin::AdminState {
        lifecycle: lifecycle.clone(),
        http_client,
        upstream_url: config.proxy.upstream_url.clone(),
    };
    let admin_app = admin::build_admin_router(admin_state);

    let listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;
    let admin_addr = std::net::SocketAddr::new(
        config.proxy.listen_addr.ip(),
        config.proxy.listen_addr.port().wrapping_add(1),
    );
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;

    let shutdown_rx = lifecycle
        .start(config.proxy.listen_addr)
        .await
        .context("lifecycle already running")?;

    info!(addr = %config.proxy.listen_addr, admin_addr = %admin_addr, "listening");

    let admin_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(admin_listener, admin_app).await {
            tracing::warn!(error = %e, "admin listener exited");
        }
    });

    let drain_timeout = lifecycle.drain_timeout();
    let lifecycle_for_signal = lifecycle.clone();

    // Two receivers fed by the same trigger: one drives axum's own graceful
    // shutdown (stop accepting, let in-flight requests finish), the other
    // starts the drain deadline that bounds how long we wait for that.
    let (drain_deadline_tx, drain_deadline_rx) = tokio::sync::oneshot::channel();
    let (serve_shutdown_tx, serve_shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_rx => {}
            _ = shutdown_signal() => {
                lifecycle_for_signal.stop().await;
            }
        }
        let _ = serve_shutdown_tx.send(());
        let _ = drain_deadline_tx.send(());
    });

    let mut serve_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown_rx.await;
            })
            .await
    });

    tokio::select! {
        res = &mut serve_handle => {
            res.context("server task panicked")?
                .context("server error")?;
        }
        _ = async move {
            let _ = drain_deadline_rx.await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            tracing::warn!("drain timeout exceeded, aborting in-flight connections");
            serve_handle.abort();
        }
    }

    tokio::time::timeout(drain_timeout, admin_task).await.ok();
    lifecycle.finish_stop().await;

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.lifecycle.status().await;
    let uptime = state.started_at.elapsed().as_secs();

    let body = serde_json::json!({
        "status": if status.running { "healthy" } else { "stopped" },
        "uptime_seconds": uptime,
        "account_count": status.pool.account_count,
        "active": status.pool.active,
        "cooldown": status.pool.cooldown,
        "blocked": status.pool.blocked,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
}
