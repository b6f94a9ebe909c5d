//! Bounded request/response log
//!
//! A FIFO ring buffer of request records with filtered, paged queries.
//! When disabled, `append` is a no-op -- the dispatcher is expected to
//! skip body capture entirely in that case so the no-op costs nothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{NewEntry, RequestLogEntry, RequestLogSummary};

/// 64 KiB, per the capture-truncation requirement.
pub const DEFAULT_BODY_CAP_BYTES: usize = 64 * 1024;

pub struct LogSink {
    enabled: bool,
    max_logs: usize,
    body_cap_bytes: usize,
    next_id: AtomicU64,
    entries: RwLock<VecDeque<RequestLogEntry>>,
}

impl LogSink {
    pub fn new(enabled: bool, max_logs: usize) -> Self {
        Self {
            enabled,
            max_logs,
            body_cap_bytes: DEFAULT_BODY_CAP_BYTES,
            next_id: AtomicU64::new(1),
            entries: RwLock::new(VecDeque::with_capacity(max_logs.min(1024))),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Append a finished request. No-op when logging is disabled.
    pub async fn append(&self, mut entry: NewEntry) {
        if !self.enabled {
            return;
        }
        entry.request_body.truncate(self.body_cap_bytes);
        entry.response_body.truncate(self.body_cap_bytes);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = RequestLogEntry {
            id,
            timestamp_ms: now_ms(),
            method: entry.method,
            path: entry.path,
            status: entry.status,
            duration_ms: entry.duration_ms,
            account_id: entry.account_id,
            error: entry.error,
            model: entry.model,
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            request_headers: entry.request_headers,
            response_headers: entry.response_headers,
            request_body: entry.request_body,
            response_body: entry.response_body,
        };

        let mut entries = self.entries.write().await;
        entries.push_back(record);
        while entries.len() > self.max_logs {
            entries.pop_front();
        }
        debug!(id, count = entries.len(), "appended request log entry");
    }

    pub async fn count(&self, filter: Option<&str>, errors_only: bool) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.matches(filter, errors_only))
            .count()
    }

    /// Newest-first page of matching entries.
    pub async fn query(
        &self,
        filter: Option<&str>,
        errors_only: bool,
        limit: usize,
        offset: usize,
    ) -> Vec<RequestLogSummary> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| e.matches(filter, errors_only))
            .skip(offset)
            .take(limit)
            .map(RequestLogSummary::from)
            .collect()
    }

    pub async fn detail(&self, id: u64) -> Option<RequestLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn empty_entry(method: &str, path: &str) -> NewEntry {
    NewEntry {
        method: method.to_string(),
        path: path.to_string(),
        status: 200,
        duration_ms: 0,
        account_id: None,
        error: None,
        model: None,
        input_tokens: None,
        output_tokens: None,
        request_headers: Vec::new(),
        response_headers: Vec::new(),
        request_body: Vec::new(),
        response_body: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_query_newest_first() {
        let sink = LogSink::new(true, 100);
        sink.append(empty_entry("GET", "/v1/a")).await;
        sink.append(empty_entry("GET", "/v1/b")).await;
        sink.append(empty_entry("GET", "/v1/c")).await;

        let page = sink.query(None, false, 10, 0).await;
        let paths: Vec<_> = page.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/v1/c", "/v1/b", "/v1/a"]);
    }

    #[tokio::test]
    async fn disabled_sink_is_a_no_op() {
        let sink = LogSink::new(false, 100);
        sink.append(empty_entry("GET", "/v1/a")).await;
        assert_eq!(sink.count(None, false).await, 0);
    }

    #[tokio::test]
    async fn eviction_is_strict_fifo_and_bounded() {
        let sink = LogSink::new(true, 3);
        for i in 0..10 {
            sink.append(empty_entry("GET", &format!("/v1/{i}"))).await;
        }
        assert_eq!(sink.count(None, false).await, 3);
        let page = sink.query(None, false, 10, 0).await;
        let paths: Vec<_> = page.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec!["/v1/9", "/v1/8", "/v1/7"]);
    }

    #[tokio::test]
    async fn filter_is_case_insensitive_substring_across_fields() {
        let sink = LogSink::new(true, 100);
        let mut e1 = empty_entry("GET", "/v1/Models");
        e1.account_id = Some("acct-Alpha".into());
        sink.append(e1).await;
        let mut e2 = empty_entry("GET", "/v1/completions");
        e2.account_id = Some("acct-beta".into());
        sink.append(e2).await;

        assert_eq!(sink.count(Some("models"), false).await, 1);
        assert_eq!(sink.count(Some("ALPHA"), false).await, 1);
        assert_eq!(sink.count(Some("acct-"), false).await, 2);
    }

    #[tokio::test]
    async fn errors_only_matches_status_or_error_field() {
        let sink = LogSink::new(true, 100);
        sink.append(empty_entry("GET", "/ok")).await;
        let mut err = empty_entry("GET", "/bad");
        err.status = 502;
        sink.append(err).await;
        let mut cancelled = empty_entry("GET", "/cancelled");
        cancelled.status = 200;
        cancelled.error = Some("client disconnected".into());
        sink.append(cancelled).await;

        assert_eq!(sink.count(None, true).await, 2);
    }

    #[tokio::test]
    async fn detail_returns_full_record_and_none_when_evicted() {
        let sink = LogSink::new(true, 1);
        sink.append(empty_entry("GET", "/v1/a")).await;
        sink.append(empty_entry("GET", "/v1/b")).await;

        assert!(sink.detail(1).await.is_none(), "evicted entry");
        let second = sink.detail(2).await.unwrap();
        assert_eq!(second.path, "/v1/b");
    }

    #[tokio::test]
    async fn bodies_are_truncated_to_the_capture_cap() {
        let sink = LogSink::new(true, 10);
        let mut entry = empty_entry("POST", "/v1/big");
        entry.request_body = vec![b'x'; DEFAULT_BODY_CAP_BYTES + 100];
        sink.append(entry).await;

        let detail = sink.detail(1).await.unwrap();
        assert_eq!(detail.request_body.len(), DEFAULT_BODY_CAP_BYTES);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let sink = LogSink::new(true, 10);
        sink.append(empty_entry("GET", "/v1/a")).await;
        sink.clear().await;
        assert_eq!(sink.count(None, false).await, 0);
    }

    #[tokio::test]
    async fn pagination_offset_and_limit() {
        let sink = LogSink::new(true, 100);
        for i in 0..5 {
            sink.append(empty_entry("GET", &format!("/v1/{i}"))).await;
        }
        let page = sink.query(None, false, 2, 1).await;
        let paths: Vec<_> = page.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec!["/v1/3", "/v1/2"]);
    }
}
