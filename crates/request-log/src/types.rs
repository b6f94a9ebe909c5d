//! Request/response telemetry record shapes

use serde::Serialize;

/// A finished (or cancelled) request, as appended by the dispatcher.
/// Bodies are pre-truncated by the caller before being handed to the sink.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub account_id: Option<String>,
    pub error: Option<String>,
    pub model: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub response_body: Vec<u8>,
}

/// The stored record: `NewEntry` plus an assigned id and timestamp.
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub id: u64,
    pub timestamp_ms: u64,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub account_id: Option<String>,
    pub error: Option<String>,
    pub model: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub response_body: Vec<u8>,
}

/// Index-view row: no headers/bodies.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogSummary {
    pub id: u64,
    pub timestamp_ms: u64,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub account_id: Option<String>,
    pub error: Option<String>,
    pub model: Option<String>,
}

impl From<&RequestLogEntry> for RequestLogSummary {
    fn from(e: &RequestLogEntry) -> Self {
        Self {
            id: e.id,
            timestamp_ms: e.timestamp_ms,
            method: e.method.clone(),
            path: e.path.clone(),
            status: e.status,
            duration_ms: e.duration_ms,
            account_id: e.account_id.clone(),
            error: e.error.clone(),
            model: e.model.clone(),
        }
    }
}

impl RequestLogEntry {
    pub(crate) fn matches(&self, filter: Option<&str>, errors_only: bool) -> bool {
        if errors_only && !(self.status >= 400 || self.error.is_some()) {
            return false;
        }
        let Some(filter) = filter else { return true };
        if filter.is_empty() {
            return true;
        }
        let needle = filter.to_lowercase();
        self.path.to_lowercase().contains(&needle)
            || self.status.to_string().contains(&needle)
            || self
                .account_id
                .as_deref()
                .is_some_and(|id| id.to_lowercase().contains(&needle))
    }
}
