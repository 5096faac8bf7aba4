//! Bounded connection pool with acquisition timeout and fatal-discard replacement.

use crate::database::backend::{Backend, BackendSession};
use crate::error::{DatabaseError, DbResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Pool sizing and admission configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: u32,
    pub max_size: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_size(mut self, min_size: u32) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Pool metrics for monitoring.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub connections_created: AtomicU32,
    pub connections_closed: AtomicU32,
    pub connection_errors: AtomicU32,
    pub acquire_timeouts: AtomicU32,
}

impl PoolMetrics {
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool metrics.
#[derive(Debug, Clone)]
pub struct PoolMetricsSnapshot {
    pub connections_created: u32,
    pub connections_closed: u32,
    pub connection_errors: u32,
    pub acquire_timeouts: u32,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
}

struct IdleSession {
    id: u64,
    session: Box<dyn BackendSession>,
    last_used_at: Instant,
}

struct PoolState {
    idle: Vec<IdleSession>,
    /// Sessions alive or being created: idle + checked out + connects in flight.
    total: u32,
    min_size: u32,
    max_size: u32,
}

struct PoolShared {
    state: Mutex<PoolState>,
    released: Notify,
    metrics: PoolMetrics,
    next_id: AtomicU64,
}

/// Bounded set of reusable backend sessions.
///
/// A session is either idle in the pool or checked out to exactly one
/// [`PoolConnection`]; the guard returns it on drop. A guard marked fatal is
/// discarded on release and the pool opens a fresh physical session the next
/// time demand requires one.
pub struct ConnectionPool {
    backend: Arc<dyn Backend>,
    shared: Arc<PoolShared>,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    /// Creates the pool and eagerly opens `min_size` sessions.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ConnectionFailed`] if the backend is
    /// unreachable while warming the minimum set.
    pub async fn new(backend: Arc<dyn Backend>, config: PoolConfig) -> DbResult<Self> {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                min_size: config.min_size,
                max_size: config.max_size.max(1),
            }),
            released: Notify::new(),
            metrics: PoolMetrics::default(),
            next_id: AtomicU64::new(1),
        });

        let pool = Self {
            backend,
            shared,
            acquire_timeout: config.acquire_timeout,
        };

        for _ in 0..config.min_size.min(config.max_size) {
            let session = pool.open_session().await?;
            let mut state = pool.shared.state.lock();
            state.total += 1;
            state.idle.push(session);
        }

        info!(
            "Connection pool ready: min={} max={} backend={}",
            config.min_size,
            config.max_size,
            pool.backend.name()
        );

        Ok(pool)
    }

    /// Checks out a session, waiting up to `timeout` for one to become
    /// available.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::PoolExhausted`] if no session becomes idle and
    /// no capacity frees up within the timeout. Callers must not hammer the
    /// pool on exhaustion; backoff belongs to the dispatcher's retry policy.
    pub async fn acquire_with_timeout(
        &self,
        timeout: Duration,
    ) -> DbResult<PoolConnection> {
        let deadline = Instant::now() + timeout;

        loop {
            enum Plan {
                Reuse(IdleSession),
                Open,
                Wait,
            }

            let plan = {
                let mut state = self.shared.state.lock();
                if let Some(idle) = state.idle.pop() {
                    Plan::Reuse(idle)
                } else if state.total < state.max_size {
                    // Reserve capacity before connecting so concurrent
                    // acquirers cannot overshoot max_size.
                    state.total += 1;
                    Plan::Open
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Reuse(idle) => {
                    if idle.session.is_broken() {
                        debug!("Discarding broken idle session {}", idle.id);
                        self.discard(idle.session);
                        continue;
                    }
                    debug!(
                        "Reusing session {} idle for {:?}",
                        idle.id,
                        idle.last_used_at.elapsed()
                    );
                    return Ok(PoolConnection::new(idle.id, idle.session, &self.shared));
                }
                Plan::Open => match self.open_session().await {
                    Ok(idle) => {
                        return Ok(PoolConnection::new(idle.id, idle.session, &self.shared));
                    }
                    Err(e) => {
                        self.shared.metrics.connection_errors.fetch_add(1, Ordering::Relaxed);
                        let mut state = self.shared.state.lock();
                        state.total -= 1;
                        drop(state);
                        self.shared.released.notify_one();
                        return Err(e);
                    }
                },
                Plan::Wait => {
                    let now = Instant::now();
                    let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
                    else {
                        self.shared.metrics.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!("Pool exhausted after {:?} wait", timeout);
                        return Err(DatabaseError::PoolExhausted);
                    };
                    if tokio::time::timeout(remaining, self.shared.released.notified())
                        .await
                        .is_err()
                    {
                        self.shared.metrics.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!("Pool exhausted after {:?} wait", timeout);
                        return Err(DatabaseError::PoolExhausted);
                    }
                }
            }
        }
    }

    /// Checks out a session with the configured default timeout.
    pub async fn acquire(&self) -> DbResult<PoolConnection> {
        self.acquire_with_timeout(self.acquire_timeout).await
    }

    /// Adjusts pool sizing. Growth takes effect immediately; shrinking takes
    /// effect as sessions are released.
    pub fn configure(&self, min_size: u32, max_size: u32) -> DbResult<()> {
        if max_size == 0 || min_size > max_size {
            return Err(DatabaseError::ConnectionFailed(format!(
                "invalid pool sizing: min={min_size} max={max_size}"
            )));
        }
        let mut state = self.shared.state.lock();
        let grew = max_size > state.max_size;
        state.min_size = min_size;
        state.max_size = max_size;
        drop(state);
        if grew {
            self.shared.released.notify_waiters();
        }
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state.lock();
        PoolStatus {
            size: state.total,
            idle: state.idle.len() as u32,
            in_use: state.total - state.idle.len() as u32,
        }
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    async fn open_session(&self) -> DbResult<IdleSession> {
        let session = self.backend.connect().await?;
        self.shared.metrics.connections_created.fetch_add(1, Ordering::Relaxed);
        Ok(IdleSession {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            session,
            last_used_at: Instant::now(),
        })
    }

    fn discard(&self, session: Box<dyn BackendSession>) {
        let mut state = self.shared.state.lock();
        state.total -= 1;
        drop(state);
        drop(session);
        self.shared.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.shared.released.notify_one();
    }
}

/// Exclusive handle to a checked-out session.
///
/// Released back to the pool on drop; discarded instead if marked fatal or
/// if the session reports itself broken.
pub struct PoolConnection {
    id: u64,
    session: Option<Box<dyn BackendSession>>,
    shared: Arc<PoolShared>,
    fatal: bool,
    checked_out_at: Instant,
}

impl std::fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnection")
            .field("id", &self.id)
            .field("session", &self.session.is_some())
            .field("fatal", &self.fatal)
            .field("checked_out_at", &self.checked_out_at)
            .finish()
    }
}

impl PoolConnection {
    fn new(id: u64, session: Box<dyn BackendSession>, shared: &Arc<PoolShared>) -> Self {
        Self {
            id,
            session: Some(session),
            shared: Arc::clone(shared),
            fatal: false,
            checked_out_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn checked_out_at(&self) -> Instant {
        self.checked_out_at
    }

    /// Forces the session to be discarded on release instead of re-idled.
    pub fn mark_fatal(&mut self) {
        self.fatal = true;
    }

    pub fn session(&mut self) -> &mut dyn BackendSession {
        self.session
            .as_deref_mut()
            .expect("session present until drop")
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let discard = self.fatal || session.is_broken();
        let mut state = self.shared.state.lock();
        if discard || state.total > state.max_size {
            state.total -= 1;
            drop(state);
            drop(session);
            self.shared.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
            if discard {
                debug!("Discarded session {} on release", self.id);
            }
        } else {
            state.idle.push(IdleSession {
                id: self.id,
                session,
                last_used_at: Instant::now(),
            });
            drop(state);
        }
        self.shared.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::mock::{MockBackend, MockScript};
    use std::collections::HashSet;

    async fn pool_with(script: &Arc<MockScript>, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(Arc::new(MockBackend::new(Arc::clone(script))), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_session() {
        let script = MockScript::new();
        let pool = pool_with(&script, PoolConfig::new().min_size(1).max_size(2)).await;

        let conn = pool.acquire().await.unwrap();
        let first_id = conn.id();
        drop(conn);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(script.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_no_double_checkout() {
        let script = MockScript::new();
        let pool = Arc::new(pool_with(&script, PoolConfig::new().min_size(0).max_size(4)).await);

        let checked_out = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::new();

        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            let checked_out = Arc::clone(&checked_out);
            handles.push(tokio::spawn(async move {
                let conn = pool
                    .acquire_with_timeout(Duration::from_secs(5))
                    .await
                    .unwrap();
                // A second borrower observing the same id while we hold the
                // guard would break the exclusivity invariant.
                assert!(checked_out.lock().insert(conn.id()));
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert!(checked_out.lock().remove(&conn.id()));
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(pool.status().size <= 4);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let script = MockScript::new();
        let pool = pool_with(&script, PoolConfig::new().min_size(0).max_size(1)).await;

        let held = pool.acquire().await.unwrap();
        let err = pool
            .acquire_with_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::PoolExhausted));
        assert_eq!(pool.metrics().acquire_timeouts, 1);
        drop(held);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let script = MockScript::new();
        let pool = Arc::new(pool_with(&script, PoolConfig::new().min_size(0).max_size(1)).await);

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire_with_timeout(Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(pool.status().in_use, 1);
        drop(conn);
    }

    #[tokio::test]
    async fn test_fatal_discard_replaces_session() {
        let script = MockScript::new();
        let pool = pool_with(&script, PoolConfig::new().min_size(0).max_size(1)).await;

        let mut conn = pool.acquire().await.unwrap();
        conn.mark_fatal();
        drop(conn);

        assert_eq!(pool.status().size, 0);
        let _conn = pool.acquire().await.unwrap();
        // Second physical session proves the discarded one was replaced.
        assert_eq!(script.connect_count(), 2);
        assert_eq!(pool.metrics().connections_closed, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_frees_reservation() {
        let script = MockScript::new();
        let pool = pool_with(&script, PoolConfig::new().min_size(0).max_size(1)).await;
        script.fail_next_connects(1);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DatabaseError::ConnectionFailed(_)));

        // Capacity reserved for the failed connect must be released.
        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.metrics().connection_errors, 1);
    }

    #[tokio::test]
    async fn test_configure_shrinks_lazily() {
        let script = MockScript::new();
        let pool = pool_with(&script, PoolConfig::new().min_size(2).max_size(2)).await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.configure(0, 1).unwrap();

        drop(a);
        drop(b);
        // First release closes the excess session, second re-idles.
        assert_eq!(pool.status().size, 1);
    }

    #[tokio::test]
    async fn test_configure_rejects_bad_sizing() {
        let script = MockScript::new();
        let pool = pool_with(&script, PoolConfig::default()).await;
        assert!(pool.configure(5, 2).is_err());
        assert!(pool.configure(0, 0).is_err());
    }
}
