//! Service-level error type and its mapping onto the HTTP error kinds.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Dispatcher errors, each mapped to exactly the structured JSON body its
/// HTTP kind mandates.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no healthy account available")]
    PoolExhausted,

    #[error("invalid api key")]
    AuthRejected,

    #[error("upstream timeout after {0}s")]
    UpstreamTimeout(u64),

    #[error("upstream returned {0}")]
    UpstreamStatus(StatusCode, Vec<u8>),

    #[error("refresh failed: {0}")]
    RefreshFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("token store error: {0}")]
    Store(#[from] account_store::Error),

    #[error("pool error: {0}")]
    Pool(#[from] account_pool::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::PoolExhausted => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "no_healthy_account"})),
            )
                .into_response(),
            Error::AuthRejected => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid_api_key"})),
            )
                .into_response(),
            Error::UpstreamTimeout(secs) => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({"error": "upstream_timeout", "after_secs": secs})),
            )
                .into_response(),
            Error::UpstreamStatus(status, body) => (status, body).into_response(),
            Error::RefreshFailed(reason) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "refresh_failed", "reason": reason})),
            )
                .into_response(),
            Error::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "bad_request", "reason": reason})),
            )
                .into_response(),
            Error::Config(reason) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "config_error", "reason": reason})),
            )
                .into_response(),
            Error::Store(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "token_store_error", "reason": e.to_string()})),
            )
                .into_response(),
            Error::Pool(account_pool::Error::PoolExhausted) => Error::PoolExhausted.into_response(),
            Error::Pool(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "pool_error", "reason": e.to_string()})),
            )
                .into_response(),
        }
    }
}
