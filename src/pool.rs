//! Connection pool.
//!
//! A bounded set of reusable [`Connection`]s. Checked-out connections are
//! returned on drop if they are idle with no open transaction; broken or
//! closed ones are discarded and replaced on demand.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::Config;
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{Error, Result};
use crate::result::QueryResult;
use crate::types::ToParams;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Settings for every connection in the pool
    pub connection: Config,
    /// Connections opened up front
    pub min_connections: u32,
    /// Upper bound on connections checked out at once
    pub max_connections: u32,
}

impl PoolConfig {
    pub fn new(connection: Config) -> Self {
        Self {
            connection,
            min_connections: 1,
            max_connections: 10,
        }
    }

    /// Parse a conninfo string or URL.
    pub fn parse(conninfo: &str) -> Result<Self> {
        Config::parse(conninfo).map(Self::new)
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool.
pub struct PooledConnection {
    /// The actual connection (None once returned to the pool)
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Idle with no open transaction, so safe to hand to the next caller.
    pub fn is_reusable(&self) -> bool {
        self.conn.as_ref().is_some_and(reusable)
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in Drop
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection already returned"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if reusable(&conn) {
                self.pool.idle.lock().push(conn);
            } else {
                debug!(status = ?conn.status(), depth = conn.depth(), "discarding pooled connection");
            }
        }
    }
}

fn reusable(conn: &Connection) -> bool {
    conn.status() == ConnectionStatus::Idle && conn.depth() == 0
}

// ============================================================================
// Pool
// ============================================================================

struct PoolInner {
    config: PoolConfig,
    idle: Mutex<Vec<Connection>>,
    semaphore: Arc<Semaphore>,
}

/// A pool of PostgreSQL connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create the pool and open `min_connections` connections.
    pub async fn connect(config: PoolConfig) -> Result<Self> {
        if config.max_connections == 0 || config.min_connections > config.max_connections {
            return Err(Error::Config(format!(
                "invalid pool bounds: min {} max {}",
                config.min_connections, config.max_connections
            )));
        }

        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            config,
            idle: Mutex::new(Vec::new()),
        });
        let pool = Self { inner };

        for _ in 0..pool.inner.config.min_connections {
            let conn = pool.create_connection().await?;
            pool.inner.idle.lock().push(conn);
        }

        debug!(
            min = pool.inner.config.min_connections,
            max = pool.inner.config.max_connections,
            "pool ready"
        );
        Ok(pool)
    }

    /// Check out a connection, waiting while the pool is exhausted.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Connection("pool is closed".to_string()))?;

        let idle = self.inner.idle.lock().pop();
        let conn = match idle {
            Some(conn) if reusable(&conn) => conn,
            _ => self.create_connection().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Execute a statement on a pooled connection.
    pub async fn execute<P: ToParams>(&self, statement: &str, params: P) -> Result<QueryResult> {
        let conn = self.acquire().await?;
        conn.execute(statement, params).await
    }

    /// Close idle connections and refuse further checkouts.
    pub async fn close(&self) {
        self.inner.semaphore.close();
        let connections = std::mem::take(&mut *self.inner.idle.lock());
        for conn in connections {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "failed to close pooled connection");
            }
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    async fn create_connection(&self) -> Result<Connection> {
        Connection::connect_with(self.inner.config.connection.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config() {
        let config = PoolConfig::parse("host=db port=5433 user=app")
            .unwrap()
            .min_connections(2)
            .max_connections(20);

        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.connection.port, Some(5433));
    }

    #[tokio::test]
    async fn test_invalid_bounds() {
        let config = PoolConfig::new(Config::new()).min_connections(3).max_connections(2);
        assert!(matches!(Pool::connect(config).await, Err(Error::Config(_))));
    }
}
