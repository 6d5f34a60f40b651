//! Database handle: pool or force-rollback lifecycle.
//!
//! A [`Database`] owns either a connection pool or, in force-rollback
//! mode, exactly one long-lived connection. Logical operations check out a
//! [`ScopedConnection`]:
//!
//! - pool mode acquires a connection and releases it afterwards
//! - force-rollback mode reuses the shared connection inside a fresh
//!   transaction that is always rolled back
//!
//! In force-rollback mode every checkout holds the shared connection until
//! its rollback completes, so checkouts never interleave.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::DatabaseConfig;
use crate::connection::Connection;
use crate::driver::{Driver, DriverConnection, DriverPool};
use crate::error::{FastpgError, FastpgResult};
use crate::postgres::PgDriver;
use crate::record::Record;
use crate::value::{Params, Value};

type SharedConnection<D> = Arc<Mutex<Option<Connection<<D as Driver>::Connection>>>>;

enum State<D: Driver> {
    Disconnected,
    Pooled(Arc<D::Pool>),
    Shared(SharedConnection<D>),
}

/// Top-level database handle.
///
/// # Example
/// ```ignore
/// let db = Database::new(DatabaseConfig::from_dsn("postgres://localhost/app"))?;
/// db.connect().await?;
///
/// let params = Params::new().bind("id", 7);
/// let user = db.fetch_one("SELECT * FROM users WHERE id = :id", Some(&params)).await?;
///
/// db.disconnect(Duration::from_secs(10)).await?;
/// ```
pub struct Database<D: Driver = PgDriver> {
    driver: D,
    config: DatabaseConfig,
    dsn: String,
    state: Mutex<State<D>>,
}

impl Database<PgDriver> {
    /// Create a handle backed by the sqlx PostgreSQL driver.
    ///
    /// Configuration problems are reported here, before any I/O.
    pub fn new(config: DatabaseConfig) -> FastpgResult<Self> {
        Self::with_driver(PgDriver, config)
    }

    /// Shorthand for a pool-mode handle addressed by a connection string.
    pub fn from_dsn(dsn: impl Into<String>) -> FastpgResult<Self> {
        Self::new(DatabaseConfig::from_dsn(dsn))
    }
}

impl<D: Driver> Database<D> {
    /// Create a handle backed by a custom driver.
    pub fn with_driver(driver: D, config: DatabaseConfig) -> FastpgResult<Self> {
        let dsn = config.dsn()?;
        Ok(Self {
            driver,
            config,
            dsn,
            state: Mutex::new(State::Disconnected),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn is_force_rollback(&self) -> bool {
        self.config.force_rollback
    }

    pub async fn is_connected(&self) -> bool {
        !matches!(*self.state.lock().await, State::Disconnected)
    }

    /// Open the pool, or the shared connection in force-rollback mode.
    pub async fn connect(&self) -> FastpgResult<()> {
        let mut state = self.state.lock().await;
        if !matches!(*state, State::Disconnected) {
            return Err(FastpgError::AlreadyConnected);
        }

        let options = &self.config.pool;
        *state = if self.config.force_rollback {
            let conn = self
                .driver
                .connect(&self.dsn, options)
                .await
                .map_err(FastpgError::Driver)?;
            tracing::info!("connected in force-rollback mode");
            State::Shared(Arc::new(Mutex::new(Some(Connection::new(conn)))))
        } else {
            let pool = self
                .driver
                .create_pool(&self.dsn, options)
                .await
                .map_err(FastpgError::Driver)?;
            tracing::info!(max_connections = options.max_connections, "connection pool created");
            State::Pooled(Arc::new(pool))
        };
        Ok(())
    }

    /// Close the pool, waiting at most `timeout` before terminating it.
    ///
    /// Running out of time is not an error: the pool is terminated and
    /// disconnect still succeeds.
    pub async fn disconnect(&self, timeout: Duration) -> FastpgResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Disconnected) {
            State::Disconnected => Err(FastpgError::NotConnected),
            State::Pooled(pool) => {
                if tokio::time::timeout(timeout, pool.close()).await.is_err() {
                    tracing::warn!(?timeout, "pool did not close in time; terminating");
                    pool.terminate();
                }
                tracing::info!("disconnected");
                Ok(())
            }
            State::Shared(shared) => {
                let conn = shared.lock().await.take();
                if let Some(conn) = conn {
                    match tokio::time::timeout(timeout, conn.close()).await {
                        Ok(result) => result?,
                        Err(_) => tracing::warn!(?timeout, "connection did not close in time; dropped"),
                    }
                }
                tracing::info!("disconnected");
                Ok(())
            }
        }
    }

    /// [`disconnect`](Self::disconnect) with the configured close timeout.
    pub async fn disconnect_default(&self) -> FastpgResult<()> {
        self.disconnect(self.config.close_timeout()).await
    }

    /// Check out a connection for one logical operation.
    ///
    /// Call [`ScopedConnection::release`] when done to observe cleanup
    /// errors; dropping the guard performs the same cleanup in the
    /// background.
    pub async fn connection(&self) -> FastpgResult<ScopedConnection<D>> {
        let lease: Checkout<D> = {
            let state = self.state.lock().await;
            match &*state {
                State::Disconnected => return Err(FastpgError::NotConnected),
                State::Pooled(pool) => Checkout::Pooled(pool.clone()),
                State::Shared(shared) => Checkout::Shared(shared.clone()),
            }
        };

        match lease {
            Checkout::Pooled(pool) => {
                let conn = pool.acquire().await.map_err(FastpgError::Driver)?;
                tracing::debug!("connection acquired");
                Ok(ScopedConnection {
                    lease: Some(Lease::Pooled {
                        conn: Connection::new(conn),
                        pool,
                    }),
                })
            }
            Checkout::Shared(shared) => {
                let mut guard = shared.lock_owned().await;
                let conn = guard.as_mut().ok_or(FastpgError::NotConnected)?;
                conn.begin_raw().await?;
                tracing::debug!("shared connection checked out");
                Ok(ScopedConnection {
                    lease: Some(Lease::Shared(guard)),
                })
            }
        }
    }

    pub async fn execute(&self, query: &str, values: Option<&Params>) -> FastpgResult<u64> {
        let mut conn = self.connection().await?;
        let result = conn.execute(query, values).await;
        conn.finish(result).await
    }

    pub async fn execute_many(&self, query: &str, values: &[Params]) -> FastpgResult<u64> {
        let mut conn = self.connection().await?;
        let result = conn.execute_many(query, values).await;
        conn.finish(result).await
    }

    pub async fn fetch_value(&self, query: &str, values: Option<&Params>) -> FastpgResult<Option<Value>> {
        let mut conn = self.connection().await?;
        let result = conn.fetch_value(query, values).await;
        conn.finish(result).await
    }

    pub async fn fetch_one(&self, query: &str, values: Option<&Params>) -> FastpgResult<Option<Record>> {
        let mut conn = self.connection().await?;
        let result = conn.fetch_one(query, values).await;
        conn.finish(result).await
    }

    pub async fn fetch_many(&self, query: &str, values: Option<&Params>) -> FastpgResult<Vec<Record>> {
        let mut conn = self.connection().await?;
        let result = conn.fetch_many(query, values).await;
        conn.finish(result).await
    }

    pub async fn copy_records_to_table(
        &self,
        table: &str,
        records: &[Vec<Value>],
        columns: Option<&[&str]>,
    ) -> FastpgResult<u64> {
        let mut conn = self.connection().await?;
        let result = conn.copy_records_to_table(table, records, columns).await;
        conn.finish(result).await
    }
}

enum Checkout<D: Driver> {
    Pooled(Arc<D::Pool>),
    Shared(SharedConnection<D>),
}

enum Lease<D: Driver> {
    Pooled {
        conn: Connection<D::Connection>,
        pool: Arc<D::Pool>,
    },
    Shared(OwnedMutexGuard<Option<Connection<D::Connection>>>),
}

impl<D: Driver> Lease<D> {
    fn connection(&self) -> &Connection<D::Connection> {
        match self {
            Lease::Pooled { conn, .. } => conn,
            Lease::Shared(guard) => guard.as_ref().expect("Shared connection should be present"),
        }
    }

    fn connection_mut(&mut self) -> &mut Connection<D::Connection> {
        match self {
            Lease::Pooled { conn, .. } => conn,
            Lease::Shared(guard) => guard.as_mut().expect("Shared connection should be present"),
        }
    }

    async fn release(self) -> FastpgResult<()> {
        match self {
            Lease::Pooled { mut conn, pool } => match conn.settle().await {
                Ok(()) => {
                    pool.release(conn.into_raw());
                    tracing::debug!("connection released");
                    Ok(())
                }
                Err(e) => {
                    // Its transaction state is unknown; never hand it to another caller.
                    tracing::warn!(error = %e, "rollback failed; closing connection");
                    if let Err(closed) = conn.into_raw().close().await {
                        tracing::warn!(error = %closed, "failed to close connection");
                    }
                    Err(e)
                }
            },
            Lease::Shared(mut guard) => {
                // The guard is held until the scope's rollback has run. The
                // rollback is queued first so an interrupted release is
                // finished by the next checkout.
                if let Some(conn) = guard.as_mut() {
                    conn.queue_rollback();
                    conn.settle().await?;
                }
                tracing::debug!("shared connection rolled back");
                Ok(())
            }
        }
    }

    async fn close(self, timeout: Duration) -> FastpgResult<()> {
        match self {
            Lease::Pooled { conn, .. } => match tokio::time::timeout(timeout, conn.close()).await {
                Ok(result) => {
                    tracing::debug!("connection closed");
                    result
                }
                Err(_) => {
                    tracing::warn!(?timeout, "connection did not close in time; dropped");
                    Ok(())
                }
            },
            // The shared connection belongs to the database.
            shared @ Lease::Shared(_) => shared.release().await,
        }
    }

    /// Cleanup without a runtime: nothing async can run.
    fn abandon(self) {
        match self {
            Lease::Pooled { conn, pool } => {
                if conn.has_pending_rollbacks() {
                    pool.discard(conn.into_raw());
                } else {
                    pool.release(conn.into_raw());
                }
            }
            Lease::Shared(mut guard) => {
                if let Some(conn) = guard.as_mut() {
                    conn.queue_rollback();
                }
                tracing::warn!("shared connection released without runtime; rollback deferred to next checkout");
            }
        }
    }
}

/// A connection checked out of a [`Database`] for one logical operation.
///
/// Derefs to [`Connection`]. Dropping it releases the connection (pool
/// mode) or rolls back its transaction (force-rollback mode) on a spawned
/// task; [`release`](Self::release) does the same inline.
pub struct ScopedConnection<D: Driver> {
    lease: Option<Lease<D>>,
}

impl<D: Driver> ScopedConnection<D> {
    /// Release now and report cleanup errors.
    pub async fn release(mut self) -> FastpgResult<()> {
        match self.lease.take() {
            Some(lease) => lease.release().await,
            None => Ok(()),
        }
    }

    /// Close the underlying connection instead of returning it, waiting at
    /// most `timeout`.
    ///
    /// In pool mode the pool opens a replacement on demand. In
    /// force-rollback mode the shared connection stays open and this is
    /// the same as [`release`](Self::release).
    pub async fn close(mut self, timeout: Duration) -> FastpgResult<()> {
        match self.lease.take() {
            Some(lease) => lease.close(timeout).await,
            None => Ok(()),
        }
    }

    /// Release, keeping the operation's error over any cleanup error.
    async fn finish<T>(self, result: FastpgResult<T>) -> FastpgResult<T> {
        let released = self.release().await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                tracing::warn!(error = %cleanup, "cleanup failed after operation error");
                Err(e)
            }
        }
    }
}

impl<D: Driver> Deref for ScopedConnection<D> {
    type Target = Connection<D::Connection>;

    fn deref(&self) -> &Self::Target {
        self.lease
            .as_ref()
            .expect("Connection should always be present")
            .connection()
    }
}

impl<D: Driver> DerefMut for ScopedConnection<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.lease
            .as_mut()
            .expect("Connection should always be present")
            .connection_mut()
    }
}

impl<D: Driver> Drop for ScopedConnection<D> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = lease.release().await {
                            tracing::warn!(error = %e, "failed to release connection");
                        }
                    });
                }
                Err(_) => lease.abandon(),
            }
        }
    }
}
