//! Driver collaborator interface.
//!
//! Everything below the query compiler talks to the database through these
//! traits: the wire protocol, authentication, type encoding and pool
//! internals all live in the implementation. [`crate::postgres::PgDriver`]
//! implements them on top of sqlx.
//!
//! Arguments arrive already compiled: positional `$N` SQL plus coerced
//! [`DriverValue`]s. Errors are boxed and travel to the caller unmodified.

use async_trait::async_trait;

use crate::coerce::DriverValue;
use crate::config::ConnectOptions;
use crate::error::DriverError;
use crate::record::RawRow;
use crate::value::Value;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Opens connections and pools.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Connection: DriverConnection;
    type Pool: DriverPool<Connection = Self::Connection>;

    /// Open one dedicated connection.
    async fn connect(&self, dsn: &str, options: &ConnectOptions) -> DriverResult<Self::Connection>;

    /// Open a connection pool.
    async fn create_pool(&self, dsn: &str, options: &ConnectOptions) -> DriverResult<Self::Pool>;
}

/// A connection pool. Sizing and health checks are the pool's business.
#[async_trait]
pub trait DriverPool: Send + Sync + 'static {
    type Connection: DriverConnection;

    /// Wait for a free connection.
    async fn acquire(&self) -> DriverResult<Self::Connection>;

    /// Hand a connection back.
    fn release(&self, conn: Self::Connection);

    /// Drop a connection without returning it. Used when it cannot be
    /// rolled back and no runtime is left to close it.
    fn discard(&self, conn: Self::Connection) {
        drop(conn);
    }

    /// Close gracefully, waiting for checked-out connections to come back.
    async fn close(&self);

    /// Close immediately without waiting.
    fn terminate(&self);
}

/// One live database connection.
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Run a statement; returns rows affected.
    async fn execute(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<u64>;

    /// Run a statement once per argument list; returns total rows affected.
    async fn execute_many(&mut self, sql: &str, arg_lists: &[Vec<DriverValue>]) -> DriverResult<u64>;

    /// First column of the first row, `None` when there is no row.
    async fn fetch_value(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<Option<Value>>;

    /// First row, `None` when there is no row.
    async fn fetch_row(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<Option<RawRow>>;

    /// All rows.
    async fn fetch_all(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<Vec<RawRow>>;

    /// Bulk-load rows into `table`; returns rows copied.
    async fn copy_records_to_table(
        &mut self,
        table: &str,
        records: &[Vec<DriverValue>],
        columns: Option<&[&str]>,
    ) -> DriverResult<u64>;

    /// Start a transaction, or a savepoint when one is already open.
    async fn begin(&mut self) -> DriverResult<()>;

    /// Commit the innermost transaction or savepoint.
    async fn commit(&mut self) -> DriverResult<()>;

    /// Roll back the innermost transaction or savepoint.
    async fn rollback(&mut self) -> DriverResult<()>;

    /// Close the connection.
    async fn close(self) -> DriverResult<()>
    where
        Self: Sized;
}
