//! Bounded async connection pool.
//!
//! At most `max_size` connections are checked out at once (a semaphore permit
//! travels with each [`PooledConnection`]). Idle connections are recycled once
//! they exceed `max_age`, health-checked lazily when they have been idle for a
//! while or have recently failed, and dropped after `max_consecutive_errors`.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const LATENCY_WINDOW: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),
    #[error("pool is closed")]
    Closed,
    #[error("failed to open connection: {0}")]
    Connect(String),
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether waiting and trying again could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_))
    }
}

/// Opens and validates connections for a [`Pool`].
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Error: std::fmt::Display + Send;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;

    fn is_healthy(&self, conn: &Self::Connection) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub max_age: Duration,
    /// Idle connections older than this are health-checked before reuse.
    pub health_check_after: Duration,
    pub max_consecutive_errors: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            acquire_timeout: Duration::from_secs(10),
            max_age: Duration::from_secs(3600),
            health_check_after: Duration::from_secs(30),
            max_consecutive_errors: 3,
        }
    }
}

impl PoolConfig {
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] when the sizes or durations are unusable.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "acquire_timeout must be positive".into(),
            ));
        }
        if self.max_consecutive_errors == 0 {
            return Err(PoolError::InvalidConfig(
                "max_consecutive_errors must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: u64,
    pub acquired: u64,
    pub released: u64,
    pub created: u64,
    pub recycled: u64,
    pub failed_health_checks: u64,
    pub timeouts: u64,
    pub avg_wait_ms: f64,
    pub p95_wait_ms: f64,
    pub max_wait_ms: f64,
}

struct Slot<T> {
    conn: T,
    created_at: Instant,
    returned_at: Instant,
    consecutive_errors: u32,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    created: AtomicU64,
    recycled: AtomicU64,
    failed_health_checks: AtomicU64,
    timeouts: AtomicU64,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Slot<C::Connection>>>,
    closed: AtomicBool,
    counters: Counters,
    waits: Mutex<VecDeque<Duration>>,
}

pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Pool<C> {
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if `config` does not validate.
    pub fn new(connector: C, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                idle: Mutex::new(VecDeque::with_capacity(config.max_size)),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
                waits: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    #[must_use]
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Check out a connection. Waiting for capacity, health-checking idle
    /// connections and opening a fresh one all share one `acquire_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Timeout`] when no usable connection is ready in time,
    /// [`PoolError::Closed`] after [`Pool::close`], or [`PoolError::Connect`] when a
    /// fresh connection cannot be opened.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let started = Instant::now();
        let timeout = self.inner.config.acquire_timeout;
        let (slot, permit) = match tokio::time::timeout(timeout, self.checkout()).await {
            Ok(checked_out) => checked_out?,
            Err(_) => {
                self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(timeout_ms = timeout.as_millis(), "connection pool exhausted");
                return Err(PoolError::Timeout(timeout));
            }
        };

        self.record_wait(started.elapsed());
        self.inner.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            slot: Some(slot),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    async fn checkout(&self) -> Result<(Slot<C::Connection>, OwnedSemaphorePermit), PoolError> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        let slot = match self.take_idle().await {
            Some(slot) => slot,
            None => self.open().await?,
        };
        Ok((slot, permit))
    }

    async fn take_idle(&self) -> Option<Slot<C::Connection>> {
        let cfg = self.inner.config;
        loop {
            let slot = self.inner.idle.lock().ok()?.pop_front()?;
            if slot.created_at.elapsed() >= cfg.max_age {
                self.inner.counters.recycled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("recycling connection past max age");
                continue;
            }
            let needs_check =
                slot.consecutive_errors > 0 || slot.returned_at.elapsed() >= cfg.health_check_after;
            if needs_check && !self.inner.connector.is_healthy(&slot.conn).await {
                self.inner
                    .counters
                    .failed_health_checks
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!("discarding unhealthy pooled connection");
                continue;
            }
            return Some(slot);
        }
    }

    async fn open(&self) -> Result<Slot<C::Connection>, PoolError> {
        let conn = self
            .inner
            .connector
            .connect()
            .await
            .map_err(|e| PoolError::Connect(e.to_string()))?;
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(Slot {
            conn,
            created_at: now,
            returned_at: now,
            consecutive_errors: 0,
        })
    }

    fn record_wait(&self, wait: Duration) {
        if let Ok(mut waits) = self.inner.waits.lock() {
            if waits.len() == LATENCY_WINDOW {
                waits.pop_front();
            }
            waits.push_back(wait);
        }
    }

    /// Open connections until `min_size` are idle, without letting idle plus
    /// checked-out connections exceed `max_size`. Returns how many were opened.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Connect`] if a connection cannot be opened.
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let mut opened = 0;
        loop {
            let idle = self.inner.idle.lock().map_or(0, |idle| idle.len());
            if idle >= self.inner.config.min_size {
                break;
            }
            // The permit stands for the connection being opened.
            let Ok(permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() else {
                break;
            };
            if idle > self.inner.semaphore.available_permits() {
                break;
            }
            let slot = self.open().await?;
            if let Ok(mut idle) = self.inner.idle.lock() {
                idle.push_back(slot);
            }
            drop(permit);
            opened += 1;
        }
        if opened > 0 {
            tracing::debug!(opened, "connection pool warmed up");
        }
        Ok(opened)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        let acquired = c.acquired.load(Ordering::Relaxed);
        let released = c.released.load(Ordering::Relaxed);
        let (avg_wait_ms, p95_wait_ms, max_wait_ms) = self.wait_summary();
        PoolStats {
            max_size: self.inner.config.max_size,
            idle: self.inner.idle.lock().map_or(0, |idle| idle.len()),
            in_use: acquired.saturating_sub(released),
            acquired,
            released,
            created: c.created.load(Ordering::Relaxed),
            recycled: c.recycled.load(Ordering::Relaxed),
            failed_health_checks: c.failed_health_checks.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            avg_wait_ms,
            p95_wait_ms,
            max_wait_ms,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn wait_summary(&self) -> (f64, f64, f64) {
        let Ok(waits) = self.inner.waits.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if waits.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut ms: Vec<f64> = waits.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        ms.sort_by(f64::total_cmp);
        let avg = ms.iter().sum::<f64>() / ms.len() as f64;
        let p95_idx = ((ms.len() as f64) * 0.95).ceil() as usize;
        let p95 = ms[p95_idx.saturating_sub(1).min(ms.len() - 1)];
        (avg, p95, ms[ms.len() - 1])
    }

    /// Stop handing out connections and drop every idle one. Connections still
    /// checked out are dropped when released.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore.close();
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.clear();
        }
        tracing::debug!("connection pool closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection<C: Connector> {
    slot: Option<Slot<C::Connection>>,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    /// Mark the last operation on this connection as failed. After
    /// `max_consecutive_errors` failures the connection is discarded on release.
    pub fn record_error(&mut self) {
        if let Some(slot) = self.slot.as_mut() {
            slot.consecutive_errors += 1;
        }
    }

    pub fn record_success(&mut self) {
        if let Some(slot) = self.slot.as_mut() {
            slot.consecutive_errors = 0;
        }
    }

    /// Return the connection to the pool. Equivalent to dropping it.
    pub fn release(self) {}
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        // The slot is only taken in `drop`.
        match &self.slot {
            Some(slot) => &slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        self.pool.counters.released.fetch_add(1, Ordering::Relaxed);
        let Some(mut slot) = self.slot.take() else {
            return;
        };
        if self.pool.closed.load(Ordering::SeqCst) {
            return;
        }
        if slot.consecutive_errors >= self.pool.config.max_consecutive_errors {
            tracing::warn!(
                errors = slot.consecutive_errors,
                "discarding connection after repeated errors"
            );
            return;
        }
        slot.returned_at = Instant::now();
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push_back(slot);
        }
    }
}
