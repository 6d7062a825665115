//! Query connection pool
//!
//! A small fixed-size pool of `tokio-postgres` clients for catalog queries
//! and snapshot transactions. A semaphore bounds the number of open
//! connections; idle clients are reused LIFO and closed clients are
//! discarded when returned.

use crate::connection::ConnectionConfig;
use crate::error::{PgError, PgResult};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

/// Default maximum number of connections
pub const DEFAULT_POOL_SIZE: usize = 20;

/// How long `get` waits for a free connection
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

struct PoolInner {
    config: ConnectionConfig,
    idle: Mutex<Vec<Client>>,
    semaphore: Arc<Semaphore>,
    size: usize,
}

/// Pool of query connections
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

impl PgPool {
    /// Create a pool; connections are opened on demand
    pub fn new(config: ConnectionConfig, size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(Vec::with_capacity(size)),
                semaphore: Arc::new(Semaphore::new(size)),
                size,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Borrow a connection, opening one if no idle connection is available
    pub async fn get(&self) -> PgResult<PooledClient> {
        let permit = tokio::time::timeout(
            ACQUIRE_TIMEOUT,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| PgError::Timeout("waiting for a pooled connection".into()))?
        .map_err(|_| PgError::Connection("pool closed".into()))?;

        let reused = {
            let mut idle = self.inner.idle.lock();
            std::iter::from_fn(|| idle.pop()).find(|c| !c.is_closed())
        };
        let client = match reused {
            Some(client) => client,
            None => self.open().await?,
        };

        Ok(PooledClient {
            client: Some(client),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Verify the database is reachable
    pub async fn check(&self) -> PgResult<()> {
        let client = self.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Drop idle connections and refuse new borrows
    pub fn close(&self) {
        self.inner.semaphore.close();
        self.inner.idle.lock().clear();
    }

    async fn open(&self) -> PgResult<Client> {
        let (client, connection) = self
            .inner
            .config
            .query_config()
            .connect(NoTls)
            .await
            .map_err(|e| {
                PgError::Connection(format!("{}: {e}", self.inner.config.redacted()))
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });
        debug!("Opened pooled connection");
        Ok(client)
    }
}

/// A connection borrowed from the pool; returned on drop
pub struct PooledClient {
    client: Option<Client>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("connection already returned")
    }
}

impl DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("connection already returned")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !client.is_closed() && !self.pool.semaphore.is_closed() {
                self.pool.idle.lock().push(client);
            }
        }
    }
}
