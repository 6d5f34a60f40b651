//! PostgreSQL driver backed by sqlx.
//!
//! Implements the [`crate::driver`] traits with `sqlx::PgPool` and
//! `sqlx::PgConnection`. Nested transactions map onto savepoints.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection as _, Executor, Postgres, Row, TypeInfo};
use std::sync::Arc;

use crate::coerce::DriverValue;
use crate::config::ConnectOptions;
use crate::copy::{copy_statement, encode_copy_batch};
use crate::driver::{Driver, DriverConnection, DriverPool, DriverResult};
use crate::record::RawRow;
use crate::value::Value;

/// The sqlx PostgreSQL driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

#[async_trait]
impl Driver for PgDriver {
    type Connection = PgConnection;
    type Pool = PgPool;

    async fn connect(&self, dsn: &str, _options: &ConnectOptions) -> DriverResult<PgConnection> {
        let conn = sqlx::PgConnection::connect(dsn).await?;
        Ok(PgConnection::new(Link::Direct(conn)))
    }

    async fn create_pool(&self, dsn: &str, options: &ConnectOptions) -> DriverResult<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .acquire_timeout(options.acquire_timeout())
            .connect(dsn)
            .await?;
        Ok(PgPool { pool })
    }
}

/// A sqlx connection pool.
#[derive(Debug, Clone)]
pub struct PgPool {
    pool: sqlx::PgPool,
}

impl PgPool {
    /// Get a reference to the underlying sqlx pool.
    pub fn inner(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

#[async_trait]
impl DriverPool for PgPool {
    type Connection = PgConnection;

    async fn acquire(&self) -> DriverResult<PgConnection> {
        let conn = self.pool.acquire().await?;
        Ok(PgConnection::new(Link::Pooled(conn)))
    }

    fn release(&self, conn: PgConnection) {
        // Dropping a sqlx pool connection returns it to the pool.
        drop(conn);
    }

    fn discard(&self, conn: PgConnection) {
        // Detached, the socket closes on drop instead of rejoining the pool.
        if let Link::Pooled(conn) = conn.link {
            drop(conn.detach());
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    /// sqlx cannot sever checked-out connections. Once the pool is marked
    /// closed they are closed as they come back instead of reused.
    fn terminate(&self) {
        if self.pool.is_closed() {
            let outstanding = self.pool.size().saturating_sub(self.pool.num_idle() as u32);
            tracing::warn!(outstanding, "pool closed; checked-out connections close when returned");
        } else {
            let pool = self.pool.clone();
            tokio::spawn(async move { pool.close().await });
        }
    }
}

enum Link {
    Pooled(PoolConnection<Postgres>),
    Direct(sqlx::PgConnection),
}

impl Link {
    fn as_mut(&mut self) -> &mut sqlx::PgConnection {
        match self {
            Link::Pooled(conn) => &mut **conn,
            Link::Direct(conn) => conn,
        }
    }
}

/// One PostgreSQL connection, pooled or dedicated.
pub struct PgConnection {
    link: Link,
    /// Open transactions; anything past the first is a savepoint
    depth: usize,
}

impl PgConnection {
    fn new(link: Link) -> Self {
        Self { link, depth: 0 }
    }

    async fn simple(&mut self, sql: &str) -> DriverResult<()> {
        self.link.as_mut().execute(sql).await?;
        Ok(())
    }

    fn savepoint(level: usize) -> String {
        format!("fastpg_savepoint_{}", level)
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &DriverValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        DriverValue::Null => query.bind(None::<String>),
        DriverValue::Bool(b) => query.bind(*b),
        DriverValue::Int(i) => query.bind(*i),
        DriverValue::Float(f) => query.bind(*f),
        DriverValue::Text(s) => query.bind(s.clone()),
        DriverValue::Bytes(b) => query.bind(b.clone()),
        DriverValue::Timestamp(ts) => query.bind(*ts),
        DriverValue::LocalTimestamp(ts) => query.bind(*ts),
        DriverValue::Date(d) => query.bind(*d),
    }
}

fn build_query<'q>(sql: &'q str, args: &[DriverValue]) -> Query<'q, Postgres, PgArguments> {
    args.iter().fold(sqlx::query(sql), bind_value)
}

/// Decode one column by its PostgreSQL type name.
fn decode_column(row: &PgRow, index: usize) -> Result<Value, sqlx::Error> {
    let type_name = row.column(index).type_info().name();

    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::Int),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(Value::from),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::Float),
        "UUID" => row.try_get::<Option<uuid::Uuid>, _>(index)?.map(Value::Uuid),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(Value::Json),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)?
            .map(Value::Timestamp),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)?
            .map(Value::LocalTimestamp),
        "DATE" => row.try_get::<Option<chrono::NaiveDate>, _>(index)?.map(Value::Date),
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(index)?.map(Value::Bytes),
        // TEXT, VARCHAR, NAME, BPCHAR; anything else needs a cast to text
        _ => row.try_get::<Option<String>, _>(index)?.map(Value::Text),
    };

    Ok(value.unwrap_or(Value::Null))
}

fn column_names(row: &PgRow) -> Arc<[String]> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn decode_row(row: &PgRow, columns: Arc<[String]>) -> Result<RawRow, sqlx::Error> {
    let values = (0..row.len())
        .map(|i| decode_column(row, i))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RawRow::new(columns, values))
}

#[async_trait]
impl DriverConnection for PgConnection {
    async fn execute(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<u64> {
        let result = build_query(sql, args).execute(self.link.as_mut()).await?;
        Ok(result.rows_affected())
    }

    async fn execute_many(&mut self, sql: &str, arg_lists: &[Vec<DriverValue>]) -> DriverResult<u64> {
        let mut affected = 0;
        for args in arg_lists {
            affected += build_query(sql, args)
                .execute(self.link.as_mut())
                .await?
                .rows_affected();
        }
        Ok(affected)
    }

    async fn fetch_value(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<Option<Value>> {
        let row = build_query(sql, args)
            .fetch_optional(self.link.as_mut())
            .await?;
        match row {
            Some(row) if !row.is_empty() => Ok(Some(decode_column(&row, 0)?)),
            _ => Ok(None),
        }
    }

    async fn fetch_row(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<Option<RawRow>> {
        let row = build_query(sql, args)
            .fetch_optional(self.link.as_mut())
            .await?;
        match row {
            Some(row) => Ok(Some(decode_row(&row, column_names(&row))?)),
            None => Ok(None),
        }
    }

    async fn fetch_all(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<Vec<RawRow>> {
        let rows = build_query(sql, args).fetch_all(self.link.as_mut()).await?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };

        let columns = column_names(first);
        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            decoded.push(decode_row(row, columns.clone())?);
        }
        Ok(decoded)
    }

    async fn copy_records_to_table(
        &mut self,
        table: &str,
        records: &[Vec<DriverValue>],
        columns: Option<&[&str]>,
    ) -> DriverResult<u64> {
        let statement = copy_statement(table, columns);
        let data = encode_copy_batch(records);

        let mut copy = self.link.as_mut().copy_in_raw(&statement).await?;
        if let Err(e) = copy.send(data.freeze()).await {
            let _ = copy.abort(e.to_string()).await;
            return Err(e.into());
        }
        Ok(copy.finish().await?)
    }

    async fn begin(&mut self) -> DriverResult<()> {
        let sql = if self.depth == 0 {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT {}", Self::savepoint(self.depth))
        };
        self.simple(&sql).await?;
        self.depth += 1;
        Ok(())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        let sql = match self.depth {
            0 | 1 => "COMMIT".to_string(),
            depth => format!("RELEASE SAVEPOINT {}", Self::savepoint(depth - 1)),
        };
        let result = self.simple(&sql).await;
        self.depth = self.depth.saturating_sub(1);
        result
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        let sql = match self.depth {
            0 | 1 => "ROLLBACK".to_string(),
            depth => {
                let name = Self::savepoint(depth - 1);
                format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}")
            }
        };
        // Depth only moves once the statement completes, so a retry after
        // cancellation targets the same level.
        let result = self.simple(&sql).await;
        self.depth = self.depth.saturating_sub(1);
        result
    }

    async fn close(self) -> DriverResult<()> {
        match self.link {
            Link::Pooled(conn) => conn.close().await?,
            Link::Direct(conn) => conn.close().await?,
        }
        Ok(())
    }
}
