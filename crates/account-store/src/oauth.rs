//! OAuth refresh-token exchange
//!
//! The only token-endpoint interaction this crate performs: refreshing an
//! existing refresh token for a new access token. Minting the first refresh
//! token via the PKCE browser flow happens outside this crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{OAUTH_CLIENT_ID, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// Response from the token endpoint's refresh-token grant.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute).
    pub expires_in: u64,
}

/// Refresh an access token using a refresh token.
///
/// On a 401/403 the refresh token itself is rejected (revoked/expired) and
/// the caller should treat the account as unrecoverable without re-auth.
/// Any other non-success status or transport failure is retryable.
pub async fn refresh_token(
    client: &reqwest::Client,
    refresh: &str,
    timeout: Duration,
) -> Result<TokenResponse> {
    refresh_token_at(client, TOKEN_ENDPOINT, refresh, timeout).await
}

/// Same as [`refresh_token`] but against an explicit endpoint, so callers
/// (and tests) can point at something other than the production token
/// endpoint. `timeout` bounds the whole request so a hung token endpoint
/// can't wedge a caller holding a single-flight refresh lock forever.
pub async fn refresh_token_at(
    client: &reqwest::Client,
    endpoint: &str,
    refresh: &str,
    timeout: Duration,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .timeout(timeout)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", OAUTH_CLIENT_ID),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::State;
    use axum::routing::post;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU16, Ordering};

    #[test]
    fn token_response_deserializes() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.refresh_token.as_deref(), Some("rt_def"));
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn token_response_tolerates_missing_optional_fields() {
        let json = r#"{"access_token":"at_abc","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(token.refresh_token.is_none());
        assert!(token.id_token.is_none());
    }

    async fn spawn_stub_server(status: Arc<AtomicU16>) -> String {
        let app = axum::Router::new().route(
            "/oauth/token",
            post(move |State(status): State<Arc<AtomicU16>>| async move {
                let code = status.load(Ordering::SeqCst);
                let response = Json(serde_json::json!({
                    "access_token": "at_new",
                    "refresh_token": "rt_new",
                    "expires_in": 3600,
                }));
                (
                    axum::http::StatusCode::from_u16(code).unwrap(),
                    response,
                )
            }),
        ).with_state(status);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/oauth/token")
    }

    #[tokio::test]
    async fn refresh_success_parses_response() {
        let status = Arc::new(AtomicU16::new(200));
        let endpoint = spawn_stub_server(status).await;
        let client = reqwest::Client::new();
        let result = refresh_token_at(&client, &endpoint, "rt_old", Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.access_token, "at_new");
    }

    #[tokio::test]
    async fn refresh_rejects_invalid_token_as_invalid_credentials() {
        let status = Arc::new(AtomicU16::new(401));
        let endpoint = spawn_stub_server(status).await;
        let client = reqwest::Client::new();
        let result = refresh_token_at(&client, &endpoint, "rt_bad", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::InvalidCredentials(_))));
    }

    #[tokio::test]
    async fn refresh_server_error_is_retryable_token_exchange() {
        let status = Arc::new(AtomicU16::new(500));
        let endpoint = spawn_stub_server(status).await;
        let client = reqwest::Client::new();
        let result = refresh_token_at(&client, &endpoint, "rt_old", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::TokenExchange(_))));
    }
}
