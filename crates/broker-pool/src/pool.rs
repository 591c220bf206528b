//! Connection pool implementation.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{ConnectionConfig, PoolConfig, RetryPolicy};
use crate::error::{PoolError, Result, TransportError};
use crate::lifecycle::{BrokerConnection, ConnectionHandle, Connector};

/// Handle type lent out by a pool over connector `C`.
pub type Handle<C> = ConnectionHandle<<C as Connector>::Connection>;

/// A pool of broker connections.
///
/// The pool is a LIFO cache of live connections, filled at startup with
/// bounded retries. It never blocks a caller: when the cache is empty, or
/// the cached connection turned out to be closed, a new connection is opened
/// on demand. Cloning is cheap and every clone shares the same cache.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

struct PoolInner<C: Connector> {
    connector: C,
    connection_config: ConnectionConfig,
    config: PoolConfig,
    // Never held across an await point.
    idle: Mutex<Vec<Handle<C>>>,
    // Handles lent out by `acquire` and not yet released.
    in_use: AtomicUsize,
    next_id: AtomicU64,
    counters: PoolCounters,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    stale_discarded: AtomicU64,
    exhausted: AtomicU64,
    close_failures: AtomicU64,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Start building a pool around `connector`.
    pub fn builder(connector: C) -> PoolBuilder<C> {
        PoolBuilder::new(connector)
    }

    /// Create a pool with an empty cache, without contacting the broker.
    ///
    /// Both configurations are validated here; a configuration error is
    /// fatal and never retried.
    pub fn new(
        connector: C,
        connection_config: ConnectionConfig,
        config: PoolConfig,
    ) -> Result<Self> {
        connection_config.validate()?;
        config.validate()?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                connection_config,
                config,
                idle: Mutex::new(Vec::new()),
                in_use: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                counters: PoolCounters::default(),
                monitor: Mutex::new(None),
            }),
        })
    }

    /// Create a pool and fill it with `pool_size` connections.
    ///
    /// A broker that stays unreachable for the whole retry budget does not
    /// fail this call: the pool comes up empty and callers discover the
    /// outage on their first [`acquire`](Self::acquire). Only configuration
    /// errors and non-transient transport errors are returned.
    pub async fn initialize(
        connector: C,
        connection_config: ConnectionConfig,
        config: PoolConfig,
    ) -> Result<Self> {
        let pool = Self::new(connector, connection_config, config)?;
        pool.fill().await?;

        if let Some(interval) = pool.inner.config.health_check_interval {
            let handle = pool.spawn_health_monitor(interval);
            *pool.inner.monitor.lock() = Some(handle);
        }

        Ok(pool)
    }

    /// Fill the cache up to `pool_size` connections, retrying per the
    /// configured [`RetryPolicy`].
    ///
    /// Connections that are cached or currently lent out count towards
    /// `pool_size`; a pool that is already full returns at once without
    /// contacting the broker. Each attempt opens a probe connection and then
    /// the remaining connections without per-connection retry. If any
    /// connection of an attempt fails, every connection opened during that
    /// attempt is closed again, so a failed attempt never leaves a partial
    /// fill behind and the attempt bound holds regardless of partial success.
    pub async fn fill(&self) -> Result<FillReport> {
        let policy: &RetryPolicy = &self.inner.config.retry;
        let pool_size = self.inner.config.pool_size as usize;
        let address = self.inner.connection_config.address();
        let mut attempt = 0;

        let missing = self.inner.missing();
        if missing == 0 {
            tracing::debug!(address = %address, pool_size, "pool already full, skipping fill");
            return Ok(FillReport {
                attempts: 0,
                opened: 0,
            });
        }

        while policy.should_retry(attempt) {
            attempt += 1;

            match self.inner.open_batch(missing).await {
                Ok(batch) => {
                    let opened = batch.len();
                    self.inner.idle.lock().extend(batch);
                    tracing::info!(
                        address = %address,
                        pool_size,
                        attempts = attempt,
                        "broker connection pool initialized"
                    );
                    return Ok(FillReport {
                        attempts: attempt,
                        opened,
                    });
                }
                Err(e) if !e.is_transient() => {
                    tracing::error!(address = %address, error = %e, "invalid broker connection parameters");
                    return Err(PoolError::Connection(e));
                }
                Err(e) => {
                    tracing::warn!(
                        address = %address,
                        attempt,
                        max_retries = policy.max_retries,
                        error = %e,
                        "broker connection attempt failed"
                    );
                    if policy.should_retry(attempt) {
                        tokio::time::sleep(policy.backoff_for_attempt(attempt)).await;
                    }
                }
            }
        }

        tracing::error!(
            address = %address,
            attempts = attempt,
            "could not connect to broker, continuing with an empty pool"
        );
        Ok(FillReport {
            attempts: attempt,
            opened: 0,
        })
    }

    /// Take a connection from the pool.
    ///
    /// The most recently returned connection is handed out first. A pooled
    /// connection that has closed since it was returned is discarded and
    /// replaced with a new one; an empty pool opens a new connection on
    /// demand. Neither path retries, and neither path waits for another
    /// caller to release a connection.
    pub async fn acquire(&self) -> Result<Handle<C>> {
        let popped = self.inner.idle.lock().pop();

        let mut handle = match popped {
            Some(handle) if handle.is_open() => handle,
            Some(stale) => {
                self.inner.counters.stale_discarded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    connection_id = stale.id(),
                    "discarding closed pooled connection"
                );
                self.inner.discard(stale).await;
                self.inner
                    .open_connection()
                    .await
                    .map_err(PoolError::Connection)?
            }
            None => {
                self.inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    pool_size = self.inner.config.pool_size,
                    "connection pool exhausted, creating new connection"
                );
                self.inner
                    .open_connection()
                    .await
                    .map_err(PoolError::Connection)?
            }
        };

        handle.metadata_mut().mark_checkout();
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(connection_id = handle.id(), "connection acquired");
        Ok(handle)
    }

    /// Take a connection wrapped in a guard that releases it on drop.
    pub async fn get(&self) -> Result<PooledConnection<C>> {
        let handle = self.acquire().await?;
        Ok(PooledConnection {
            pool: self.clone(),
            handle: Some(handle),
        })
    }

    /// Return a connection to the pool.
    ///
    /// Open connections go back on top of the stack without a capacity
    /// check; callers must only release what they acquired from this pool.
    /// Closed connections are dropped.
    pub fn release(&self, mut handle: Handle<C>) {
        // Saturates: releasing a handle that was never acquired must not wrap.
        let _ = self
            .inner
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if handle.is_open() {
            handle.metadata_mut().mark_checkin();
            tracing::trace!(connection_id = handle.id(), "connection released");
            self.inner.idle.lock().push(handle);
        } else {
            tracing::info!(
                connection_id = handle.id(),
                "dropping closed connection instead of returning it to the pool"
            );
        }
    }

    /// Close every pooled connection and empty the pool.
    ///
    /// Individual close failures are logged and skipped. Safe to call more
    /// than once; the pool stays usable and later acquires open connections
    /// on demand. Also stops a health monitor started by
    /// [`initialize`](Self::initialize), waiting for a health check in
    /// progress to wind down before the cache is drained.
    pub async fn close_all(&self) {
        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.abort();
            // Cancelled or finished; either way it no longer touches the cache.
            let _ = monitor.await;
        }

        let drained = std::mem::take(&mut *self.inner.idle.lock());
        let total = drained.len();
        let mut failures = 0usize;

        for handle in drained {
            if !handle.is_open() {
                continue;
            }
            if let Err(e) = handle.close().await {
                failures += 1;
                self.inner.counters.close_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = handle.id(),
                    error = %e,
                    "failed to close pooled connection"
                );
            }
        }

        tracing::info!(connections = total, failures, "connection pool closed");
    }

    /// Remove closed connections from the pool.
    pub fn prune_stale(&self) -> usize {
        let pruned = {
            let mut idle = self.inner.idle.lock();
            let before = idle.len();
            idle.retain(|handle| handle.is_open());
            before - idle.len()
        };

        if pruned > 0 {
            self.inner
                .counters
                .stale_discarded
                .fetch_add(pruned as u64, Ordering::Relaxed);
            tracing::debug!(pruned, "pruned closed connections");
        }
        pruned
    }

    /// Open connections until cached plus lent-out connections reach
    /// `pool_size` again.
    ///
    /// No retries; stops at the first failure.
    pub async fn replenish(&self) -> usize {
        let missing = self.inner.missing();
        let mut opened = 0;

        for _ in 0..missing {
            match self.inner.open_connection().await {
                Ok(handle) => {
                    self.inner.idle.lock().push(handle);
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, opened, missing, "pool replenish failed");
                    break;
                }
            }
        }
        opened
    }

    /// Prune closed connections and replenish the pool.
    pub async fn health_check(&self) -> HealthReport {
        let pruned = self.prune_stale();
        let opened = self.replenish().await;
        let report = HealthReport {
            pruned,
            opened,
            idle: self.idle_count(),
        };
        tracing::debug!(
            pruned = report.pruned,
            opened = report.opened,
            idle = report.idle,
            "pool health check"
        );
        report
    }

    /// Run [`health_check`](Self::health_check) every `period` on a tokio task.
    ///
    /// The task only holds a weak reference and exits once every clone of
    /// the pool has been dropped. Must be called from within a runtime.
    pub fn spawn_health_monitor(&self, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    tracing::debug!("pool dropped, stopping health monitor");
                    break;
                };
                let pool = ConnectionPool { inner };
                pool.health_check().await;
            }
        })
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let counters = &self.inner.counters;
        PoolStatus {
            idle: self.idle_count(),
            in_use: self.inner.in_use.load(Ordering::Acquire),
            pool_size: self.inner.config.pool_size,
            created: counters.created.load(Ordering::Relaxed),
            stale_discarded: counters.stale_discarded.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
            close_failures: counters.close_failures.load(Ordering::Relaxed),
        }
    }

    /// Number of connections currently cached.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Ids of the cached connections, bottom of the stack first.
    #[must_use]
    pub fn idle_ids(&self) -> Vec<u64> {
        self.inner.idle.lock().iter().map(|h| h.id()).collect()
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the connection configuration.
    #[must_use]
    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.inner.connection_config
    }

    /// Get the connector.
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }
}

impl<C: Connector> PoolInner<C> {
    /// Connections needed to bring cached plus lent-out up to `pool_size`.
    fn missing(&self) -> usize {
        let held = self.idle.lock().len() + self.in_use.load(Ordering::Acquire);
        (self.config.pool_size as usize).saturating_sub(held)
    }

    /// Best-effort close of a connection that is leaving the pool.
    async fn discard(&self, handle: Handle<C>) {
        if let Err(e) = handle.close().await {
            tracing::debug!(
                connection_id = handle.id(),
                error = %e,
                "failed to close discarded connection"
            );
        }
    }

    async fn open_connection(&self) -> std::result::Result<Handle<C>, TransportError> {
        let conn = self.connector.connect(&self.connection_config).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = id, address = %self.connection_config.address(), "opened broker connection");
        Ok(ConnectionHandle::new(id, conn))
    }

    /// Open `count` connections, closing all of them if any one fails.
    async fn open_batch(&self, count: usize) -> std::result::Result<Vec<Handle<C>>, TransportError> {
        let mut batch = Vec::with_capacity(count);

        for _ in 0..count {
            match self.open_connection().await {
                Ok(handle) => batch.push(handle),
                Err(e) => {
                    if !batch.is_empty() {
                        tracing::debug!(opened = batch.len(), "rolling back partial pool fill");
                    }
                    for handle in batch {
                        if let Err(close_err) = handle.close().await {
                            tracing::warn!(
                                connection_id = handle.id(),
                                error = %close_err,
                                "failed to close connection during rollback"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(batch)
    }
}

impl<C: Connector> Drop for PoolInner<C> {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.connection_config.address())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ConnectionPool`].
#[derive(Debug)]
pub struct PoolBuilder<C> {
    connector: C,
    connection_config: ConnectionConfig,
    config: PoolConfig,
}

impl<C: Connector> PoolBuilder<C> {
    fn new(connector: C) -> Self {
        Self {
            connector,
            connection_config: ConnectionConfig::default(),
            config: PoolConfig::default(),
        }
    }

    /// Set the broker connection configuration.
    #[must_use]
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Replace the whole pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of pre-warmed connections.
    #[must_use]
    pub fn pool_size(mut self, size: u32) -> Self {
        self.config = self.config.pool_size(size);
        self
    }

    /// Set the bound on startup fill attempts.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.config = self.config.max_retries(max);
        self
    }

    /// Use a fixed delay between startup fill attempts.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config = self.config.retry_delay(delay);
        self
    }

    /// Set the retry policy for the startup fill.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config = self.config.retry(policy);
        self
    }

    /// Run a background health check on the given interval.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.health_check_interval(interval);
        self
    }

    /// Build the pool and fill it. See [`ConnectionPool::initialize`].
    pub async fn build(self) -> Result<ConnectionPool<C>> {
        ConnectionPool::initialize(self.connector, self.connection_config, self.config).await
    }

    /// Build the pool with an empty cache, without contacting the broker.
    pub fn build_lazy(self) -> Result<ConnectionPool<C>> {
        ConnectionPool::new(self.connector, self.connection_config, self.config)
    }
}

/// Outcome of [`ConnectionPool::fill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillReport {
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Connections added to the pool; zero when the retry budget ran out.
    pub opened: usize,
}

/// Outcome of [`ConnectionPool::health_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// Closed connections removed.
    pub pruned: usize,
    /// New connections added.
    pub opened: usize,
    /// Connections cached after the check.
    pub idle: usize,
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of cached connections.
    pub idle: usize,
    /// Connections acquired and not yet released.
    pub in_use: usize,
    /// Configured pool size.
    pub pool_size: u32,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Closed connections discarded on acquire or prune.
    pub stale_discarded: u64,
    /// Acquires that found the pool empty.
    pub exhausted: u64,
    /// Close failures during teardown.
    pub close_failures: u64,
}

/// A connection retrieved from the pool.
///
/// When dropped, the connection is returned to the pool (or dropped, if it
/// has closed in the meantime).
pub struct PooledConnection<C: Connector> {
    pool: ConnectionPool<C>,
    // Only `None` inside `detach` and `drop`, both of which consume the guard.
    handle: Option<Handle<C>>,
}

impl<C: Connector> PooledConnection<C> {
    /// Detach the connection from the pool.
    ///
    /// The returned handle is not released when it goes out of scope; pass
    /// it to [`ConnectionPool::release`] to return it. Until then it still
    /// counts as lent out.
    pub fn detach(mut self) -> Option<Handle<C>> {
        self.handle.take()
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = Handle<C>;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Handle<C> {
        self.handle
            .as_ref()
            .expect("pooled connection is present until detach or drop")
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection_id", &self.handle.as_ref().map(|h| h.id()))
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}
