//! Connection pool for siphon-rdbc
//!
//! Bounded pool of connections shared by concurrently running cursors:
//! - Semaphore-limited size with an acquire timeout
//! - Validation on borrow, recycling by lifetime and idle time
//! - Counters for created/closed connections and exhaustion
//!
//! # Example
//!
//! ```rust,ignore
//! use siphon_rdbc::prelude::*;
//! use siphon_rdbc::postgres::PgConnectionFactory;
//!
//! let pool = SimpleConnectionPool::new(
//!     PoolConfig::new("postgres://localhost/db").with_max_size(4),
//!     Arc::new(PgConnectionFactory),
//! ).await?;
//!
//! let conn = pool.get().await?;
//! conn.query("SELECT 1", &[]).await?;
//! // returned to the pool on drop
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell, Semaphore};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};

/// Connection pool trait
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Get a connection from the pool
    async fn get(&self) -> Result<PooledConnection>;

    /// Return a connection to the pool
    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant);

    /// Get current pool size
    fn size(&self) -> usize;

    /// Get number of idle connections
    fn idle(&self) -> usize;

    /// Get pool statistics
    fn stats(&self) -> PoolStats;

    /// Close all connections and shutdown the pool
    async fn close(&self) -> Result<()>;
}

/// A connection borrowed from the pool
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    pool: Arc<dyn ConnectionPool>,
}

impl PooledConnection {
    /// Wrap a connection so that it goes back to `pool` when dropped
    pub fn new(conn: Box<dyn Connection>, created_at: Instant, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            pool,
        }
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &dyn Connection {
        &**self
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        // Only taken in Drop.
        self.conn
            .as_deref()
            .expect("pooled connection used after return")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.pool.clone();
        let created_at = self.created_at;
        handle.spawn(async move {
            pool.return_connection(conn, created_at).await;
        });
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Connections opened eagerly at startup
    pub min_size: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime
    pub max_lifetime: Duration,
    /// Idle connections older than this are closed on next borrow
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 0,
            max_size: 4,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Create pool config from a prepared connection config
    pub fn from_connection(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of successful acquisitions
    pub acquisitions: u64,
    /// Number of acquire timeouts
    pub exhausted_count: u64,
    /// Number of connections discarded by validation
    pub health_check_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted_count: AtomicU64,
    health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

/// Semaphore-bounded connection pool.
///
/// Idle connections are reused LIFO. A permit is held for as long as a
/// connection is borrowed and released when it comes back.
pub struct SimpleConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    idle_count: AtomicUsize,
    semaphore: Semaphore,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
    self_ref: OnceCell<Weak<Self>>,
}

impl SimpleConnectionPool {
    /// Create a new connection pool, opening `min_size` connections eagerly.
    ///
    /// Eager connection failures are returned so that bad credentials surface
    /// at startup.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        if config.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }

        let pool = Arc::new(Self {
            semaphore: Semaphore::new(config.max_size),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            idle_count: AtomicUsize::new(0),
            config,
            factory,
            total_connections: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            shutdown: AtomicBool::new(false),
            self_ref: OnceCell::new(),
        });
        let _ = pool.self_ref.set(Arc::downgrade(&pool));

        let eager = pool.config.min_size.min(pool.config.max_size);
        for _ in 0..eager {
            let conn = pool.create_connection().await?;
            let now = Instant::now();
            pool.push_idle(PoolEntry {
                conn,
                created_at: now,
                last_used: now,
            })
            .await;
        }

        Ok(pool)
    }

    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.factory.connect(&self.config.connection).await?;
        self.total_connections.fetch_add(1, Ordering::AcqRel);
        AtomicPoolStats::bump(&self.stats.connections_created);
        Ok(conn)
    }

    async fn push_idle(&self, entry: PoolEntry) {
        let mut idle = self.idle.lock().await;
        idle.push(entry);
        self.idle_count.store(idle.len(), Ordering::Release);
    }

    fn discard(&self) {
        self.total_connections.fetch_sub(1, Ordering::AcqRel);
        AtomicPoolStats::bump(&self.stats.connections_closed);
    }

    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    async fn take_idle(&self) -> Option<(Box<dyn Connection>, Instant)> {
        let mut idle = self.idle.lock().await;
        let found = loop {
            let Some(entry) = idle.pop() else {
                break None;
            };
            if self.should_recycle(&entry) {
                let _ = entry.conn.close().await;
                self.discard();
                continue;
            }
            if self.config.test_on_borrow && !entry.conn.is_valid().await {
                self.discard();
                AtomicPoolStats::bump(&self.stats.health_check_failures);
                continue;
            }
            break Some((entry.conn, entry.created_at));
        };
        self.idle_count.store(idle.len(), Ordering::Release);
        found
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn get(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "pool is shut down".to_string(),
            });
        }

        let permit = tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                AtomicPoolStats::bump(&self.stats.exhausted_count);
                Error::PoolExhausted {
                    message: format!(
                        "timed out waiting for a connection ({}ms)",
                        self.config.acquire_timeout.as_millis()
                    ),
                }
            })?
            .map_err(|_| Error::PoolExhausted {
                message: "pool semaphore closed".to_string(),
            })?;

        let (conn, created_at) = match self.take_idle().await {
            Some(found) => found,
            None => (self.create_connection().await?, Instant::now()),
        };

        let pool_arc: Arc<dyn ConnectionPool> = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::internal("pool has been dropped"))?;

        AtomicPoolStats::bump(&self.stats.acquisitions);
        // Released in return_connection.
        permit.forget();
        Ok(PooledConnection::new(conn, created_at, pool_arc))
    }

    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant) {
        self.semaphore.add_permits(1);

        if self.shutdown.load(Ordering::Acquire) {
            let _ = conn.close().await;
            self.discard();
            return;
        }

        self.push_idle(PoolEntry {
            conn,
            created_at,
            last_used: Instant::now(),
        })
        .await;
    }

    fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    fn idle(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);

        let mut idle = self.idle.lock().await;
        for entry in idle.drain(..) {
            let _ = entry.conn.close().await;
            self.discard();
        }
        self.idle_count.store(0, Ordering::Release);

        Ok(())
    }
}
