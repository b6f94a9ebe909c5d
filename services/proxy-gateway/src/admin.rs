//! Admin API: proxy lifecycle status and per-account usage introspection.
//!
//! Runs on a separate listener from the Dispatcher so the fallback route
//! that forwards "any path" upstream never has to carve out reserved
//! paths on the same port.
//!
//! Endpoints:
//! - GET /status            — proxy status object (§6)
//! - GET /usage/{account_id} — rate-limit window snapshot for one account

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;

use crate::service::Lifecycle;
use crate::usage;

#[derive(Clone)]
pub struct AdminState {
    pub lifecycle: Arc<Lifecycle>,
    pub http_client: reqwest::Client,
    pub upstream_url: String,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/usage/{account_id}", get(account_usage))
        .with_state(state)
}

#[derive(Serialize)]
struct StatusResponse {
    running: bool,
    port: u16,
    account_count: usize,
    active: usize,
    cooldown: usize,
    blocked: usize,
}

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    let s = state.lifecycle.status().await;
    let body = StatusResponse {
        running: s.running,
        port: s.port,
        account_count: s.pool.account_count,
        active: s.pool.active,
        cooldown: s.pool.cooldown,
        blocked: s.pool.blocked,
    };
    (StatusCode::OK, axum::Json(body))
}

async fn account_usage(
    State(state): State<AdminState>,
    Path(account_id): Path<String>,
) -> impl IntoResponse {
    let pool = state.lifecycle.pool();
    match usage::get_usage(pool, &state.http_client, &state.upstream_url, &account_id).await {
        Ok(snapshot) => (StatusCode::OK, axum::Json(snapshot)).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::Pool;
    use account_store::TokenStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> AdminState {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TokenStore::open(dir.path()).await.unwrap());
        let pool = Arc::new(
            Pool::load(store, reqwest::Client::new(), Duration::from_secs(60), Duration::from_secs(5))
                .await
                .unwrap(),
        );
        AdminState {
            lifecycle: Arc::new(Lifecycle::new(pool, Duration::from_secs(5))),
            http_client: reqwest::Client::new(),
            upstream_url: "http://127.0.0.1:1".to_string(),
        }
    }

    #[tokio::test]
    async fn status_reports_stopped_and_empty_pool() {
        let state = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["running"], false);
        assert_eq!(json["account_count"], 0);
    }

    #[tokio::test]
    async fn usage_for_unknown_account_is_not_found() {
        let state = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/usage/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
