use super::config::ConnectionConfig;
use crate::core::{AccessorError, Result};
use crate::storage::ConnectionManager;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{Level, event};

/// Connection pool
///
/// Bounds the number of checked-out connections with a semaphore and caches
/// released healthy connections for reuse. Every checkout must end in
/// [`PooledConnection::release`] or [`PooledConnection::finish`]; a guard that
/// is dropped instead is treated as unhealthy and its connection discarded.
pub struct ConnectionPool<M: ConnectionManager> {
    shared: Arc<PoolShared<M>>,
    reporter: Option<JoinHandle<()>>,
}

struct PoolShared<M: ConnectionManager> {
    manager: M,
    config: ConnectionConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<M::Connection>>,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    checked_out: usize,
}

/// A cached connection waiting for reuse
struct IdleConnection<C> {
    connection: C,
    idle_since: Instant,
}

impl<C> IdleConnection<C> {
    fn new(connection: C) -> Self {
        Self {
            connection,
            idle_since: Instant::now(),
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        idle_timeout.is_some_and(|timeout| self.idle_since.elapsed() > timeout)
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Create a pool and open `min_cached` connections eagerly
    pub async fn new(manager: M, config: ConnectionConfig) -> Result<Self> {
        config.validate().map_err(AccessorError::Config)?;

        let shared = Arc::new(PoolShared {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                checked_out: 0,
            }),
            manager,
            config,
        });

        shared.ensure_min_cached().await?;

        let reporter = shared
            .config
            .status_interval
            .map(|interval| tokio::spawn(report_status(Arc::downgrade(&shared), interval)));

        Ok(Self { shared, reporter })
    }

    /// Check out a connection, waiting at most `acquire_timeout`
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        let start = Instant::now();
        let permits = Arc::clone(&self.shared.permits);

        let wait = timeout(self.shared.config.acquire_timeout, permits.acquire_owned());
        let permit = match wait.await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AccessorError::PoolClosed),
            Err(_) => {
                let err = AccessorError::PoolTimeout {
                    waited: start.elapsed(),
                    max_connections: self.shared.config.max_connections,
                };
                let status = self.status();
                event!(
                    Level::ERROR,
                    severity = "emergency",
                    database = %self.shared.manager.database(),
                    checked_out = status.checked_out,
                    cached = status.cached,
                    error = %err,
                    "connection pool exhausted"
                );
                return Err(err);
            }
        };

        let connection = match self.shared.take_idle()? {
            Some(connection) => connection,
            None => match self.shared.manager.connect().await {
                Ok(connection) => connection,
                Err(err) => {
                    event!(
                        Level::ERROR,
                        database = %self.shared.manager.database(),
                        error = %err,
                        "failed to open store connection"
                    );
                    return Err(err);
                }
            },
        };

        self.shared.lock_state()?.checked_out += 1;

        Ok(PooledConnection {
            connection: Some(connection),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Get pool status
    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    /// Stop handing out connections and close the cached ones
    ///
    /// Connections currently checked out are closed when released.
    pub fn close(&self) {
        self.shared.permits.close();
        let drained: Vec<_> = match self.shared.lock_state() {
            Ok(mut state) => state.idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        event!(
            Level::DEBUG,
            database = %self.shared.manager.database(),
            closed = drained.len(),
            "connection pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.permits.is_closed()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }
}

impl<M: ConnectionManager> Drop for ConnectionPool<M> {
    fn drop(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }
    }
}

impl<M: ConnectionManager> PoolShared<M> {
    fn lock_state(&self) -> Result<MutexGuard<'_, PoolState<M::Connection>>> {
        Ok(self.state.lock()?)
    }

    async fn ensure_min_cached(&self) -> Result<()> {
        let missing = {
            let state = self.lock_state()?;
            self.config
                .min_cached
                .saturating_sub(state.idle.len() + state.checked_out)
        };

        for _ in 0..missing {
            let connection = self.manager.connect().await?;
            self.lock_state()?
                .idle
                .push_back(IdleConnection::new(connection));
        }

        Ok(())
    }

    /// Pop a cached connection, closing any that sat idle too long
    fn take_idle(&self) -> Result<Option<M::Connection>> {
        let mut expired = Vec::new();
        let found = {
            let mut state = self.lock_state()?;
            let mut found = None;
            while let Some(idle) = state.idle.pop_front() {
                if idle.is_idle_too_long(self.config.idle_timeout) {
                    expired.push(idle);
                } else {
                    found = Some(idle.connection);
                    break;
                }
            }
            found
        };

        if !expired.is_empty() {
            event!(
                Level::DEBUG,
                database = %self.manager.database(),
                evicted = expired.len(),
                "evicted idle connections"
            );
        }

        Ok(found)
    }

    fn check_in(&self, connection: M::Connection, healthy: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.checked_out = state.checked_out.saturating_sub(1);

        if healthy && !self.permits.is_closed() {
            state.idle.push_back(IdleConnection::new(connection));
            return;
        }
        drop(state);
        drop(connection);

        if !healthy {
            event!(
                Level::DEBUG,
                database = %self.manager.database(),
                "discarded unhealthy connection"
            );
        }
    }

    fn status(&self) -> PoolStatus {
        let (checked_out, cached, next_expiry) = match self.state.lock() {
            Ok(state) => (
                state.checked_out,
                state.idle.len(),
                self.config.idle_timeout.and_then(|timeout| {
                    state.idle.iter().map(|idle| idle.idle_since + timeout).min()
                }),
            ),
            Err(_) => (0, 0, None),
        };

        PoolStatus {
            checked_out,
            cached,
            max_connections: self.config.max_connections,
            next_expiry,
        }
    }
}

async fn report_status<M: ConnectionManager>(shared: Weak<PoolShared<M>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(pool) = shared.upgrade() else {
            break;
        };
        let status = pool.status();
        event!(
            Level::INFO,
            database = %pool.manager.database(),
            checked_out = status.checked_out,
            cached = status.cached,
            max_connections = status.max_connections,
            next_expiry_ms = status.next_expiry_in().map(|d| d.as_millis() as u64),
            "connection pool status"
        );
    }
}

/// Connection pool status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub checked_out: usize,
    pub cached: usize,
    pub max_connections: usize,
    /// When the longest-idle cached connection becomes eligible for eviction
    pub next_expiry: Option<Instant>,
}

impl PoolStatus {
    pub fn next_expiry_in(&self) -> Option<Duration> {
        self.next_expiry
            .map(|expiry| expiry.saturating_duration_since(Instant::now()))
    }
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Status: {}/{} checked out, {} cached",
            self.checked_out, self.max_connections, self.cached
        )?;
        if let Some(next) = self.next_expiry_in() {
            write!(f, ", next expiry in {}ms", next.as_millis())?;
        }
        Ok(())
    }
}

/// RAII guard for a checked-out connection
///
/// Dereferences to the store connection.
pub struct PooledConnection<M: ConnectionManager> {
    connection: Option<M::Connection>,
    shared: Arc<PoolShared<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Return the connection to the pool
    ///
    /// `healthy = false` closes the connection instead of caching it.
    pub fn release(mut self, healthy: bool) {
        if let Some(connection) = self.connection.take() {
            self.shared.check_in(connection, healthy);
        }
    }

    /// Release with health derived from `result` and pass the result through
    pub fn finish<T>(self, result: Result<T>) -> Result<T> {
        let healthy = match &result {
            Ok(_) => true,
            Err(err) => !err.breaks_connection(),
        };
        self.release(healthy);
        result
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        self.connection
            .as_ref()
            .expect("connection is present until released")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        self.connection
            .as_mut()
            .expect("connection is present until released")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            // Panic or cancelled future: the connection state is unknown.
            event!(
                Level::WARN,
                database = %self.shared.manager.database(),
                "pooled connection dropped without release; discarding"
            );
            self.shared.check_in(connection, false);
        }
    }
}
