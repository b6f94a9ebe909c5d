//! Pool state machine, round-robin selection, and single-flight refresh
//!
//! The pool holds an in-memory snapshot of accounts read from the token
//! store. Each account has a health state (`Active`, `Refreshing`,
//! `Cooldown`, `Blocked`), a round-robin cursor is shared pool-wide, and
//! refresh single-flight is guarded per account so concurrent stale-token
//! pickers share one upstream refresh call (double-checked locking, the
//! same shape as a cached-value guard: check unlocked, lock, re-check).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use account_store::{TokenStore, Tokens};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
const MAX_COOLDOWN: Duration = Duration::from_secs(600);
const COOLDOWN_PROMOTE_AT_FAILURES: u32 = 3;
const BLOCK_AT_FAILURES: u32 = 10;

/// Externally-visible account health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Active,
    Refreshing,
    Cooldown,
    Blocked,
}

impl AccountState {
    pub fn label(&self) -> &'static str {
        match self {
            AccountState::Active => "active",
            AccountState::Refreshing => "refreshing",
            AccountState::Cooldown => "cooldown",
            AccountState::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RawState {
    Active,
    Refreshing,
    Cooldown(Instant),
    Blocked,
}

/// How an upstream response for a leased account should be classified.
/// Status-code driven, per the pool's transition table -- no body
/// inspection beyond the caller supplying whether a 403 carried an
/// explicit ban indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Unauthorized,
    RateLimited,
    ServerError,
    TransportError,
    ForbiddenBanned,
}

pub fn classify_status(status: u16, forbidden_ban_indicator: bool) -> Outcome {
    match status {
        200..=399 => Outcome::Success,
        401 => Outcome::Unauthorized,
        403 if forbidden_ban_indicator => Outcome::ForbiddenBanned,
        429 => Outcome::RateLimited,
        500..=599 => Outcome::ServerError,
        _ => Outcome::ServerError,
    }
}

/// A leased account with a fresh access token, ready for one request.
#[derive(Debug, Clone)]
pub struct Lease {
    pub account_id: String,
    pub access_token: String,
}

struct Entry {
    id: String,
    access_token: Mutex<String>,
    refresh_token: Mutex<String>,
    expires_at_ms: AtomicU64,
    raw_state: Mutex<RawState>,
    consecutive_failures: AtomicU32,
    consecutive_429: AtomicU32,
    in_flight: AtomicU32,
    /// Held for the duration of an actual refresh call; other pickers of
    /// this account queue on it and, once they acquire it, re-check
    /// freshness instead of refreshing again.
    refresh_lock: Mutex<()>,
}

impl Entry {
    fn new(id: String, tokens: Tokens, expires_at_ms: u64) -> Self {
        Self {
            id,
            access_token: Mutex::new(tokens.access_token),
            refresh_token: Mutex::new(tokens.refresh_token),
            expires_at_ms: AtomicU64::new(expires_at_ms),
            raw_state: Mutex::new(RawState::Active),
            consecutive_failures: AtomicU32::new(0),
            consecutive_429: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            refresh_lock: Mutex::new(()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub account_count: usize,
    pub active: usize,
    pub refreshing: usize,
    pub cooldown: usize,
    pub blocked: usize,
}

enum RefreshOutcome {
    Fresh(String),
    Blocked,
    Transient,
}

/// Account pool: round-robin selection, health state machine, and
/// request-time refresh, backed by the on-disk token store.
pub struct Pool {
    ids: RwLock<Vec<String>>,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    cursor: AtomicUsize,
    token_store: Arc<TokenStore>,
    http_client: reqwest::Client,
    refresh_skew: Duration,
    refresh_timeout: Duration,
    token_endpoint: String,
}

impl Pool {
    /// Build a pool from the token store's current contents, refreshing
    /// against the production OAuth token endpoint.
    pub async fn load(
        token_store: Arc<TokenStore>,
        http_client: reqwest::Client,
        refresh_skew: Duration,
        refresh_timeout: Duration,
    ) -> Result<Self> {
        Self::load_with_endpoint(
            token_store,
            http_client,
            refresh_skew,
            refresh_timeout,
            account_store::constants::TOKEN_ENDPOINT.to_string(),
        )
        .await
    }

    /// Same as [`Pool::load`] but against an explicit token endpoint and
    /// refresh timeout -- used by tests to point refresh at a local
    /// stand-in server and to exercise timeout behavior.
    pub async fn load_with_endpoint(
        token_store: Arc<TokenStore>,
        http_client: reqwest::Client,
        refresh_skew: Duration,
        refresh_timeout: Duration,
        token_endpoint: String,
    ) -> Result<Self> {
        let pool = Self {
            ids: RwLock::new(Vec::new()),
            entries: RwLock::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
            token_store,
            http_client,
            refresh_skew,
            refresh_timeout,
            token_endpoint,
        };
        pool.reload().await?;
        Ok(pool)
    }

    /// Reread the token store and reconcile membership. Safe to call with
    /// requests in flight: existing entries are updated in place, never
    /// replaced, so outstanding leases remain valid.
    pub async fn reload(&self) -> Result<()> {
        let summaries = self.token_store.list().await?;
        let mut entries = self.entries.write().await;
        let mut new_ids = Vec::with_capacity(summaries.len());

        for summary in &summaries {
            new_ids.push(summary.id.clone());
            let record = self.token_store.load(&summary.id).await?;
            match entries.get(&summary.id) {
                Some(entry) => {
                    *entry.access_token.lock().await = record.tokens.access_token;
                    *entry.refresh_token.lock().await = record.tokens.refresh_token;
                    entry
                        .expires_at_ms
                        .store(summary.access_token_expires_at_ms, Ordering::SeqCst);
                }
                None => {
                    entries.insert(
                        summary.id.clone(),
                        Arc::new(Entry::new(
                            summary.id.clone(),
                            record.tokens,
                            summary.access_token_expires_at_ms,
                        )),
                    );
                    info!(account_id = %summary.id, "account added to pool");
                }
            }
        }

        let stale_ids: Vec<String> = entries
            .keys()
            .filter(|id| !new_ids.contains(id))
            .cloned()
            .collect();
        for id in stale_ids {
            entries.remove(&id);
            info!(account_id = %id, "account removed from pool");
        }

        new_ids.sort();
        *self.ids.write().await = new_ids;
        Ok(())
    }

    /// Select the next usable account via round-robin.
    pub async fn pick(&self) -> Result<Lease> {
        let ids = self.ids.read().await.clone();
        let n = ids.len();
        if n == 0 {
            return Err(Error::PoolExhausted);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;

        // Snapshot the Arc<Entry> handles up front and drop the map lock --
        // refresh_if_stale below performs real I/O, and holders must never
        // block reload()'s entries.write().await across that.
        let candidates: Vec<Option<Arc<Entry>>> = {
            let entries = self.entries.read().await;
            (0..n)
                .map(|offset| {
                    let idx = (start + offset) % n;
                    entries.get(&ids[idx]).cloned()
                })
                .collect()
        };
        let mut refreshing_candidate: Option<Arc<Entry>> = None;

        for candidate in candidates {
            let Some(entry) = candidate else {
                continue;
            };

            {
                let mut state = entry.raw_state.lock().await;
                match *state {
                    RawState::Blocked => continue,
                    RawState::Cooldown(until) => {
                        if Instant::now() >= until {
                            *state = RawState::Active;
                        } else {
                            continue;
                        }
                    }
                    RawState::Refreshing => {
                        if refreshing_candidate.is_none() {
                            refreshing_candidate = Some(entry.clone());
                        }
                        continue;
                    }
                    RawState::Active => {}
                }
            }

            match self.refresh_if_stale(&entry).await {
                RefreshOutcome::Fresh(access_token) => {
                    entry.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Ok(Lease {
                        account_id: entry.id.clone(),
                        access_token,
                    });
                }
                RefreshOutcome::Blocked | RefreshOutcome::Transient => continue,
            }
        }

        if let Some(entry) = refreshing_candidate {
            let _guard = entry.refresh_lock.lock().await;
            if matches!(*entry.raw_state.lock().await, RawState::Active) {
                let access_token = entry.access_token.lock().await.clone();
                entry.in_flight.fetch_add(1, Ordering::SeqCst);
                return Ok(Lease {
                    account_id: entry.id.clone(),
                    access_token,
                });
            }
        }

        Err(Error::PoolExhausted)
    }

    /// Obtain a lease for a specific account, refreshing its token first if
    /// stale. Unlike [`Pool::pick`], this targets one account directly
    /// rather than round-robin, and does not consult `in_flight`/cursor --
    /// callers that don't forward a request through it (e.g. usage
    /// introspection) should still call [`Pool::report`] if the caller
    /// makes an upstream call with the returned token.
    pub async fn pick_account(&self, account_id: &str) -> Result<Lease> {
        let entry = {
            let entries = self.entries.read().await;
            entries.get(account_id).cloned()
        };
        let Some(entry) = entry else {
            return Err(Error::PoolExhausted);
        };
        if matches!(*entry.raw_state.lock().await, RawState::Blocked) {
            return Err(Error::PoolExhausted);
        }
        match self.refresh_if_stale(&entry).await {
            RefreshOutcome::Fresh(access_token) => Ok(Lease {
                account_id: entry.id.clone(),
                access_token,
            }),
            RefreshOutcome::Blocked | RefreshOutcome::Transient => Err(Error::PoolExhausted),
        }
    }

    /// Report the outcome of a completed (or cancelled) lease.
    /// Decrements `in_flight` exactly once. For `Unauthorized`, drives a
    /// forced single-flight refresh and returns whether the caller may
    /// retry the request on a fresh lease.
    pub async fn report(&self, lease: &Lease, outcome: Outcome) -> bool {
        let entry = {
            let entries = self.entries.read().await;
            entries.get(&lease.account_id).cloned()
        };
        let Some(entry) = entry else {
            return false;
        };
        // Saturating: a report without a matching pick (as in some unit
        // tests that exercise transitions directly) must not underflow.
        let _ = entry
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));

        match outcome {
            Outcome::Success => {
                entry.consecutive_failures.store(0, Ordering::SeqCst);
                entry.consecutive_429.store(0, Ordering::SeqCst);
                let mut state = entry.raw_state.lock().await;
                if matches!(*state, RawState::Cooldown(_)) {
                    *state = RawState::Active;
                }
                true
            }
            Outcome::Unauthorized => {
                matches!(self.force_refresh(&entry).await, RefreshOutcome::Fresh(_))
            }
            Outcome::RateLimited => {
                let n = entry.consecutive_429.fetch_add(1, Ordering::SeqCst) + 1;
                let secs = (DEFAULT_COOLDOWN.as_secs() << (n - 1).min(4)).min(MAX_COOLDOWN.as_secs());
                info!(account_id = %entry.id, cooldown_secs = secs, "rate limited, entering cooldown");
                *entry.raw_state.lock().await =
                    RawState::Cooldown(Instant::now() + Duration::from_secs(secs));
                false
            }
            Outcome::ServerError | Outcome::TransportError => {
                let n = entry.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= BLOCK_AT_FAILURES {
                    warn!(account_id = %entry.id, "blocked after repeated failures");
                    *entry.raw_state.lock().await = RawState::Blocked;
                } else if n == COOLDOWN_PROMOTE_AT_FAILURES {
                    *entry.raw_state.lock().await =
                        RawState::Cooldown(Instant::now() + DEFAULT_COOLDOWN);
                }
                false
            }
            Outcome::ForbiddenBanned => {
                warn!(account_id = %entry.id, "blocked: forbidden with ban indicator");
                *entry.raw_state.lock().await = RawState::Blocked;
                false
            }
        }
    }

    /// Counts for the status object.
    pub async fn status(&self) -> PoolStatus {
        let entries = self.entries.read().await;
        let mut status = PoolStatus {
            account_count: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            match *entry.raw_state.lock().await {
                RawState::Active => status.active += 1,
                RawState::Refreshing => status.refreshing += 1,
                RawState::Cooldown(until) => {
                    if Instant::now() >= until {
                        status.active += 1;
                    } else {
                        status.cooldown += 1;
                    }
                }
                RawState::Blocked => status.blocked += 1,
            }
        }
        status
    }

    pub async fn account_ids(&self) -> Vec<String> {
        self.ids.read().await.clone()
    }

    async fn refresh_if_stale(&self, entry: &Arc<Entry>) -> RefreshOutcome {
        let skew_ms = self.refresh_skew.as_millis() as u64;
        if entry.expires_at_ms.load(Ordering::SeqCst) > now_ms() + skew_ms {
            return RefreshOutcome::Fresh(entry.access_token.lock().await.clone());
        }
        self.do_refresh(entry, skew_ms).await
    }

    async fn force_refresh(&self, entry: &Arc<Entry>) -> RefreshOutcome {
        self.do_refresh(entry, u64::MAX).await
    }

    /// Single-flight refresh: acquire the account's refresh lock, then
    /// re-check whether a concurrent holder already refreshed before we
    /// got the lock. `skew_budget` lets `force_refresh` always refresh by
    /// passing a budget no token could satisfy.
    async fn do_refresh(&self, entry: &Arc<Entry>, skew_budget: u64) -> RefreshOutcome {
        let _guard = entry.refresh_lock.lock().await;
        if skew_budget != u64::MAX && entry.expires_at_ms.load(Ordering::SeqCst) > now_ms() + skew_budget
        {
            return RefreshOutcome::Fresh(entry.access_token.lock().await.clone());
        }

        *entry.raw_state.lock().await = RawState::Refreshing;
        let refresh_token = entry.refresh_token.lock().await.clone();

        match account_store::refresh_token_at(
            &self.http_client,
            &self.token_endpoint,
            &refresh_token,
            self.refresh_timeout,
        )
        .await
        {
            Ok(response) => {
                let new_access = response.access_token;
                let new_refresh = response.refresh_token.unwrap_or(refresh_token);
                let new_expires = now_ms() + response.expires_in.saturating_mul(1000);

                *entry.access_token.lock().await = new_access.clone();
                *entry.refresh_token.lock().await = new_refresh.clone();
                entry.expires_at_ms.store(new_expires, Ordering::SeqCst);

                let tokens = Tokens {
                    id_token: response.id_token.unwrap_or_default(),
                    access_token: new_access.clone(),
                    refresh_token: new_refresh,
                    account_id: entry.id.clone(),
                };
                if let Err(e) = self.token_store.update_tokens(&entry.id, tokens).await {
                    warn!(account_id = %entry.id, error = %e, "failed to persist refreshed token");
                }

                *entry.raw_state.lock().await = RawState::Active;
                debug!(account_id = %entry.id, "refresh succeeded");
                RefreshOutcome::Fresh(new_access)
            }
            Err(account_store::Error::InvalidCredentials(reason)) => {
                warn!(account_id = %entry.id, reason, "refresh token rejected, blocking account");
                *entry.raw_state.lock().await = RawState::Blocked;
                RefreshOutcome::Blocked
            }
            Err(e) => {
                warn!(account_id = %entry.id, error = %e, "refresh failed transiently");
                *entry.raw_state.lock().await = RawState::Active;
                RefreshOutcome::Transient
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
