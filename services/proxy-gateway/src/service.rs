//! Process-wide proxy lifecycle: a singleton keyed by listening port,
//! guarded by a single mutex, exposing `start`/`stop`/`reload`/`status`.
//!
//! Unlike the account pool's per-account state machine, this one has no
//! concurrent instances to reconcile -- the proxy either isn't running, is
//! running, or is draining towards stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use account_pool::{Pool, PoolStatus};
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tracing::info;

/// Runtime-visible lifecycle state, returned by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Running,
    Draining,
}

/// `{running, port, account_count, active, cooldown, blocked}` per spec.
/// `running` is true for both `Running` and `Draining` -- the listener is
/// still up until the serving task actually exits.
#[derive(Debug, Clone, Copy)]
pub struct ProxyStatus {
    pub running: bool,
    pub state: LifecycleState,
    pub port: u16,
    pub pool: PoolStatus,
}

struct Running {
    port: u16,
    started_at: Instant,
    state: LifecycleState,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

/// Process-wide proxy lifecycle singleton.
pub struct Lifecycle {
    pool: Arc<Pool>,
    inner: Mutex<Option<Running>>,
    drain_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("proxy already running on port {0}")]
    AlreadyRunning(u16),
}

impl Lifecycle {
    pub fn new(pool: Arc<Pool>, drain_timeout: Duration) -> Self {
        Self {
            pool,
            inner: Mutex::new(None),
            drain_timeout,
        }
    }

    /// Mark the lifecycle as running on `addr`, returning a receiver the
    /// caller selects on to know when a `stop()` has been requested.
    pub async fn start(&self, addr: SocketAddr) -> Result<oneshot::Receiver<()>, Error> {
        let mut guard = self.inner.lock().await;
        if let Some(running) = guard.as_ref() {
            return Err(Error::AlreadyRunning(running.port));
        }
        let (tx, rx) = oneshot::channel();
        *guard = Some(Running {
            port: addr.port(),
            started_at: Instant::now(),
            state: LifecycleState::Running,
            shutdown_tx: Some(tx),
        });
        info!(%addr, "proxy listener starting");
        Ok(rx)
    }

    /// Signal the serving task to begin draining. A no-op if already stopped
    /// or already draining. The slot is cleared once the caller's serving
    /// task actually finishes and calls [`Lifecycle::finish_stop`].
    pub async fn stop(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(running) = guard.as_mut() {
            if let Some(tx) = running.shutdown_tx.take() {
                info!(port = running.port, "proxy draining");
                running.state = LifecycleState::Draining;
                let _ = tx.send(());
            }
        }
    }

    /// Clear the running slot once the serving task has fully exited,
    /// whether via a drained `stop()` or the serve future returning on its
    /// own. Idempotent.
    pub async fn finish_stop(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(running) = guard.take() {
            info!(port = running.port, "proxy stopped");
        }
    }

    /// Forward to the pool's reload; never interrupts an in-flight request.
    pub async fn reload(&self) -> account_pool::Result<()> {
        self.pool.reload().await
    }

    pub async fn status(&self) -> ProxyStatus {
        let guard = self.inner.lock().await;
        let pool_status = self.pool.status().await;
        match guard.as_ref() {
            Some(running) => ProxyStatus {
                running: true,
                state: running.state,
                port: running.port,
                pool: pool_status,
            },
            None => ProxyStatus {
                running: false,
                state: LifecycleState::Stopped,
                port: 0,
                pool: pool_status,
            },
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_store::TokenStore;
    use std::time::Duration;

    async fn empty_pool() -> Arc<Pool> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TokenStore::open(dir.path()).await.unwrap());
        Arc::new(
            Pool::load(store, reqwest::Client::new(), Duration::from_secs(60), Duration::from_secs(5))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn start_twice_fails_with_already_running() {
        let lifecycle = Lifecycle::new(empty_pool().await, Duration::from_secs(5));
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let _rx = lifecycle.start(addr).await.unwrap();
        let second = lifecycle.start(addr).await;
        assert!(matches!(second, Err(Error::AlreadyRunning(9001))));
    }

    #[tokio::test]
    async fn stop_while_stopped_is_a_no_op() {
        let lifecycle = Lifecycle::new(empty_pool().await, Duration::from_secs(5));
        lifecycle.stop().await;
        let status = lifecycle.status().await;
        assert!(!status.running);
    }

    #[tokio::test]
    async fn status_reflects_running_port() {
        let lifecycle = Lifecycle::new(empty_pool().await, Duration::from_secs(5));
        let addr: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        let _rx = lifecycle.start(addr).await.unwrap();
        let status = lifecycle.status().await;
        assert!(status.running);
        assert_eq!(status.port, 9002);
    }

    #[tokio::test]
    async fn stop_signals_shutdown_receiver() {
        let lifecycle = Lifecycle::new(empty_pool().await, Duration::from_secs(5));
        let addr: SocketAddr = "127.0.0.1:9003".parse().unwrap();
        let rx = lifecycle.start(addr).await.unwrap();
        lifecycle.stop().await;
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn stop_transitions_to_draining_but_stays_running_until_finish_stop() {
        let lifecycle = Lifecycle::new(empty_pool().await, Duration::from_secs(5));
        let addr: SocketAddr = "127.0.0.1:9004".parse().unwrap();
        let _rx = lifecycle.start(addr).await.unwrap();

        lifecycle.stop().await;
        let status = lifecycle.status().await;
        assert!(status.running);
        assert_eq!(status.state, LifecycleState::Draining);

        lifecycle.finish_stop().await;
        let status = lifecycle.status().await;
        assert!(!status.running);
        assert_eq!(status.state, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn start_after_finish_stop_succeeds_on_same_port() {
        let lifecycle = Lifecycle::new(empty_pool().await, Duration::from_secs(5));
        let addr: SocketAddr = "127.0.0.1:9005".parse().unwrap();
        let _rx = lifecycle.start(addr).await.unwrap();
        lifecycle.stop().await;
        lifecycle.finish_stop().await;

        let rx2 = lifecycle.start(addr).await;
        assert!(rx2.is_ok());
    }
}
