//! HTTP proxy dispatcher: authenticate, pick an account, forward to
//! upstream, observe the outcome, retry once on 401, and log.
//!
//! Responses with a `text/event-stream` content type are relayed chunk-wise
//! as they arrive rather than buffered in full; everything else is buffered
//! so it can be replayed on a 401 retry and inspected for usage telemetry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use account_pool::{Lease, Outcome, Pool, classify_status};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use common::Secret;
use futures_util::TryStreamExt;
use request_log::{LogSink, NewEntry};
use serde_json::Value;
use tracing::warn;

use crate::error::Error;

/// Bodies no larger than this are kept around for a single 401-triggered
/// retry. Larger bodies are still forwarded, just not replayable.
const REPLAY_LIMIT: usize = 1024 * 1024;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Headers stripped from an inbound request before forwarding: hop-by-hop
/// plus whatever carried the caller's own credential to this proxy.
fn is_stripped_inbound_header(name: &str) -> bool {
    is_hop_by_hop(name) || name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case("x-api-key")
        || name.eq_ignore_ascii_case("host")
}

#[derive(Clone)]
pub struct DispatcherState {
    pub pool: Arc<Pool>,
    pub log_sink: Arc<LogSink>,
    pub http_client: reqwest::Client,
    pub upstream_url: String,
    pub api_key: Option<Secret<String>>,
    pub request_timeout: Duration,
}

fn authenticate(state: &DispatcherState, headers: &HeaderMap) -> Result<(), Error> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));

    match presented {
        Some(key) if key == expected.expose().as_str() => Ok(()),
        _ => Err(Error::AuthRejected),
    }
}

/// Top-level axum handler: forwards any path to the configured upstream.
pub async fn dispatch(
    State(state): State<Arc<DispatcherState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();

    if let Err(e) = authenticate(&state, &headers) {
        return e.into_response();
    }

    let path_and_query = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path())
        .to_string();

    let lease = match state.pool.pick().await {
        Ok(lease) => lease,
        Err(e) => return Error::from(e).into_response(),
    };

    let replay_body = (body.len() <= REPLAY_LIMIT).then(|| body.clone());
    let model = extract_model(&body);
    let logged_request_body = state.log_sink.enabled().then(|| body.to_vec());

    let first = forward_with_lease(&state, &method, &path_and_query, &headers, body, &lease).await;

    let (final_lease, final_status, final_headers, final_body, transport_error) = match first {
        Ok(ForwardedResponse::Streamed { status, headers: resp_headers, response }) => {
            // A streaming upstream response is never an auth rejection, so
            // there is nothing to retry here -- just report and pass through.
            let outcome = classify_status(status.as_u16(), false);
            state.pool.report(&lease, outcome).await;
            (lease, status, resp_headers, FinalBody::Streamed(response), None)
        }
        Ok(ForwardedResponse::Buffered { status, headers: resp_headers, body: resp_body }) => {
            if status == StatusCode::UNAUTHORIZED {
                let retry_ok = state.pool.report(&lease, Outcome::Unauthorized).await;
                if retry_ok {
                    if let Some(replay) = replay_body {
                        match retry_after_refresh(&state, &method, &path_and_query, &headers, replay).await
                        {
                            Some((retry_lease, status2, headers2, body2)) => {
                                (retry_lease, status2, headers2, body2, None)
                            }
                            None => (lease, status, resp_headers, FinalBody::Buffered(resp_body), None),
                        }
                    } else {
                        warn!("401 response not retried: request body exceeded replay limit");
                        (lease, status, resp_headers, FinalBody::Buffered(resp_body), None)
                    }
                } else {
                    (lease, status, resp_headers, FinalBody::Buffered(resp_body), None)
                }
            } else {
                let outcome = classify_status(status.as_u16(), false);
                state.pool.report(&lease, outcome).await;
                (lease, status, resp_headers, FinalBody::Buffered(resp_body), None)
            }
        }
        Err(e) => {
            state.pool.report(&lease, Outcome::TransportError).await;
            (
                lease,
                StatusCode::GATEWAY_TIMEOUT,
                HeaderMap::new(),
                FinalBody::Buffered(Bytes::new()),
                Some(e),
            )
        }
    };

    let elapsed = start.elapsed();
    let duration_ms = elapsed.as_millis() as u64;
    if let Some(e) = &transport_error {
        crate::metrics::record_upstream_error(if e.is_timeout() { "timeout" } else { "transport" });
    }
    crate::metrics::record_request(final_status.as_u16(), method.as_str(), elapsed.as_secs_f64());

    // Usage extraction and full-body logging need the complete response in
    // memory, which a streamed body deliberately never is.
    let (input_tokens, output_tokens, response_body_for_log) = match &final_body {
        FinalBody::Buffered(bytes) => {
            let (input, output) = extract_usage(bytes);
            (input, output, bytes.to_vec())
        }
        FinalBody::Streamed(_) => (None, None, Vec::new()),
    };

    let entry = NewEntry {
        method: method.to_string(),
        path: strip_query(&path_and_query),
        status: final_status.as_u16(),
        duration_ms,
        account_id: Some(final_lease.account_id.clone()),
        error: transport_error.as_ref().map(|e| e.to_string()),
        model,
        input_tokens,
        output_tokens,
        request_headers: headers_to_vec(&headers),
        response_headers: headers_to_vec(&final_headers),
        request_body: logged_request_body.unwrap_or_default(),
        response_body: response_body_for_log,
    };
    state.log_sink.append(entry).await;

    if transport_error.is_some() {
        return Error::UpstreamTimeout(state.request_timeout.as_secs()).into_response();
    }

    build_response(final_status, final_headers, final_body)
}

/// Retry once on a fresh lease after a successful forced refresh. Returns
/// `None` if no account is available for the retry.
async fn retry_after_refresh(
    state: &DispatcherState,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Option<(Lease, StatusCode, HeaderMap, FinalBody)> {
    let lease = state.pool.pick().await.ok()?;
    match forward_with_lease(state, method, path_and_query, headers, body, &lease).await {
        Ok(ForwardedResponse::Buffered { status, headers: resp_headers, body: resp_body }) => {
            let outcome = classify_status(status.as_u16(), false);
            state.pool.report(&lease, outcome).await;
            Some((lease, status, resp_headers, FinalBody::Buffered(resp_body)))
        }
        Ok(ForwardedResponse::Streamed { status, headers: resp_headers, response }) => {
            let outcome = classify_status(status.as_u16(), false);
            state.pool.report(&lease, outcome).await;
            Some((lease, status, resp_headers, FinalBody::Streamed(response)))
        }
        Err(_) => {
            state.pool.report(&lease, Outcome::TransportError).await;
            None
        }
    }
}

/// Outcome of forwarding a request upstream: either the full body was
/// buffered, or the response looked like an event stream and is carried
/// through unread so its body can be relayed chunk-wise.
enum ForwardedResponse {
    Buffered { status: StatusCode, headers: HeaderMap, body: Bytes },
    Streamed { status: StatusCode, headers: HeaderMap, response: reqwest::Response },
}

/// The response body as it will be sent back to the caller: buffered bytes
/// or an upstream response whose body is relayed as a live stream.
enum FinalBody {
    Buffered(Bytes),
    Streamed(reqwest::Response),
}

async fn forward_with_lease(
    state: &DispatcherState,
    method: &Method,
    path_and_query: &str,
    inbound_headers: &HeaderMap,
    body: Bytes,
    lease: &Lease,
) -> Result<ForwardedResponse, reqwest::Error> {
    let url = format!("{}{}", state.upstream_url.trim_end_matches('/'), path_and_query);

    let mut req = state
        .http_client
        .request(method.clone(), &url)
        .timeout(state.request_timeout)
        .bearer_auth(&lease.access_token);

    for (name, value) in inbound_headers {
        if is_stripped_inbound_header(name.as_str()) {
            continue;
        }
        req = req.header(name.clone(), value.clone());
    }

    let response = req.body(body).send().await?;
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut resp_headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_ref()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            resp_headers.insert(n, v);
        }
    }

    let is_event_stream = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    if is_event_stream {
        return Ok(ForwardedResponse::Streamed {
            status,
            headers: resp_headers,
            response,
        });
    }

    let body = response.bytes().await?;
    Ok(ForwardedResponse::Buffered { status, headers: resp_headers, body })
}

fn build_response(status: StatusCode, headers: HeaderMap, body: FinalBody) -> Response {
    let mut response = match body {
        FinalBody::Buffered(bytes) => Response::new(axum::body::Body::from(bytes)),
        FinalBody::Streamed(upstream) => {
            let stream = upstream
                .bytes_stream()
                .map_err(|e| std::io::Error::other(e.to_string()));
            Response::new(axum::body::Body::from_stream(stream))
        }
    };
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn headers_to_vec(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !name.as_str().eq_ignore_ascii_case("authorization") && !name.as_str().eq_ignore_ascii_case("x-api-key")
        })
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect()
}

fn strip_query(path_and_query: &str) -> String {
    path_and_query.split('?').next().unwrap_or(path_and_query).to_string()
}

fn extract_model(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(String::from)
}

fn extract_usage(body: &[u8]) -> (Option<u64>, Option<u64>) {
    let Some(usage) = serde_json::from_slice::<Value>(body).ok().and_then(|v| v.get("usage").cloned()) else {
        return (None, None);
    };
    let input = usage.get("input_tokens").and_then(Value::as_u64);
    let output = usage.get("output_tokens").and_then(Value::as_u64);
    (input, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn test_inbound_auth_headers_are_stripped() {
        assert!(is_stripped_inbound_header("Authorization"));
        assert!(is_stripped_inbound_header("x-api-key"));
        assert!(is_stripped_inbound_header("Host"));
        assert!(!is_stripped_inbound_header("Content-Type"));
    }

    #[test]
    fn extracts_model_from_top_level_json_key() {
        let body = br#"{"model": "gpt-5", "messages": []}"#;
        assert_eq!(extract_model(body), Some("gpt-5".to_string()));
    }

    #[test]
    fn missing_model_field_yields_none() {
        let body = br#"{"messages": []}"#;
        assert_eq!(extract_model(body), None);
    }

    #[test]
    fn extracts_usage_token_counts_from_response() {
        let body = br#"{"usage": {"input_tokens": 12, "output_tokens": 34}}"#;
        assert_eq!(extract_usage(body), (Some(12), Some(34)));
    }

    #[test]
    fn non_json_body_yields_no_usage() {
        assert_eq!(extract_usage(b"not json"), (None, None));
    }

    #[test]
    fn strip_query_removes_query_string() {
        assert_eq!(strip_query("/v1/models?foo=bar"), "/v1/models");
        assert_eq!(strip_query("/v1/models"), "/v1/models");
    }
}
