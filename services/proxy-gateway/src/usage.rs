//! Usage Reader: rate-limit window introspection for a single account.

use std::time::{SystemTime, UNIX_EPOCH};

use account_pool::Pool;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const USAGE_PATH: &str = "/v1/usage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Unavailable,
    PrimaryWindowAvailableOnly,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct Window {
    pub used_percent: f64,
    pub window_minutes: u32,
    pub resets_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub account_id: String,
    pub primary: Option<Window>,
    pub secondary: Option<Window>,
    pub availability: Availability,
    pub captured_at: u64,
}

#[derive(Debug, Deserialize)]
struct RawWindow {
    used_percent: f64,
    window_minutes: u32,
    resets_at: u64,
}

#[derive(Debug, Deserialize)]
struct RawUsageResponse {
    primary: Option<RawWindow>,
    secondary: Option<RawWindow>,
}

fn availability_of(primary: &Option<Window>, secondary: &Option<Window>) -> Availability {
    let exhausted = |w: &Window| w.used_percent >= 100.0;
    match (primary, secondary) {
        (Some(p), Some(s)) => {
            if !exhausted(p) && !exhausted(s) {
                Availability::Available
            } else if exhausted(p) && exhausted(s) {
                Availability::Unavailable
            } else if !exhausted(p) {
                Availability::PrimaryWindowAvailableOnly
            } else {
                Availability::Unknown
            }
        }
        (Some(p), None) => {
            if !exhausted(p) {
                Availability::PrimaryWindowAvailableOnly
            } else {
                Availability::Unavailable
            }
        }
        _ => Availability::Unknown,
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Calls the upstream rate-limit introspection endpoint for `account_id`,
/// obtaining an access token via the Pool (refreshing it first if stale).
pub async fn get_usage(
    pool: &Pool,
    http_client: &reqwest::Client,
    upstream_url: &str,
    account_id: &str,
) -> Result<UsageSnapshot, Error> {
    let lease = pool.pick_account(account_id).await?;

    let url = format!("{}{}", upstream_url.trim_end_matches('/'), USAGE_PATH);
    let response = http_client
        .get(&url)
        .bearer_auth(&lease.access_token)
        .send()
        .await
        .map_err(|e| Error::RefreshFailed(e.to_string()))?;

    if !response.status().is_success() {
        let status = axum::http::StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
        let body = response.bytes().await.unwrap_or_default().to_vec();
        return Err(Error::UpstreamStatus(status, body));
    }

    let raw: RawUsageResponse = response
        .json()
        .await
        .map_err(|e| Error::BadRequest(format!("malformed usage response: {e}")))?;

    let primary = raw.primary.map(|w| Window {
        used_percent: w.used_percent,
        window_minutes: w.window_minutes,
        resets_at: w.resets_at,
    });
    let secondary = raw.secondary.map(|w| Window {
        used_percent: w.used_percent,
        window_minutes: w.window_minutes,
        resets_at: w.resets_at,
    });
    let availability = availability_of(&primary, &secondary);

    Ok(UsageSnapshot {
        account_id: account_id.to_string(),
        primary,
        secondary,
        availability,
        captured_at: now_secs(),
    })
}
