//! Connection handle: named-parameter queries over one driver connection.

use crate::coerce::coerce_row;
use crate::compiler::{compile_many, compile_query};
use crate::driver::DriverConnection;
use crate::error::{FastpgError, FastpgResult};
use crate::record::Record;
use crate::transaction::Transaction;
use crate::value::{Params, Value};

/// One bound driver connection.
///
/// Every query method compiles `:name` placeholders first, then hands the
/// positional SQL and coerced arguments to the driver. Operations on one
/// handle run strictly in the order they are issued.
///
/// Handles come from [`crate::Database::connection`]; the scoped guard it
/// returns derefs to this type.
pub struct Connection<C> {
    raw: C,
    /// Transactions dropped without commit or rollback
    pending_rollbacks: usize,
}

impl<C: DriverConnection> Connection<C> {
    pub(crate) fn new(raw: C) -> Self {
        Self {
            raw,
            pending_rollbacks: 0,
        }
    }

    pub(crate) fn into_raw(self) -> C {
        self.raw
    }

    pub(crate) fn has_pending_rollbacks(&self) -> bool {
        self.pending_rollbacks > 0
    }

    pub(crate) fn queue_rollback(&mut self) {
        self.pending_rollbacks += 1;
    }

    /// Run rollbacks queued by abandoned transactions.
    ///
    /// An entry is cleared only once its rollback attempt has completed, so
    /// a cancelled settle leaves it for the next operation.
    pub(crate) async fn settle(&mut self) -> FastpgResult<()> {
        while self.pending_rollbacks > 0 {
            tracing::debug!("rolling back abandoned transaction");
            let result = self.raw.rollback().await;
            self.pending_rollbacks -= 1;
            result.map_err(FastpgError::Driver)?;
        }
        Ok(())
    }

    pub(crate) async fn begin_raw(&mut self) -> FastpgResult<()> {
        self.settle().await?;
        // Queued while BEGIN is in flight: if this future is dropped mid-way,
        // the next operation rolls back whatever BEGIN may have opened.
        self.queue_rollback();
        let result = self.raw.begin().await;
        self.pending_rollbacks -= 1;
        result.map_err(FastpgError::Driver)
    }

    /// Commit the innermost open transaction. Scopes nested inside it that
    /// were abandoned are rolled back first.
    pub(crate) async fn commit_raw(&mut self) -> FastpgResult<()> {
        self.settle().await?;
        self.raw.commit().await.map_err(FastpgError::Driver)
    }

    pub(crate) async fn rollback_raw(&mut self) -> FastpgResult<()> {
        self.settle().await?;
        self.raw.rollback().await.map_err(FastpgError::Driver)
    }

    pub(crate) async fn close(mut self) -> FastpgResult<()> {
        let settled = self.settle().await;
        let closed = self.raw.close().await.map_err(FastpgError::Driver);
        settled.and(closed)
    }

    /// Execute a statement; returns the number of rows affected.
    ///
    /// ```ignore
    /// let params = Params::new().bind("id", 7).bind("name", "alice");
    /// conn.execute("UPDATE users SET name = :name WHERE id = :id", Some(&params)).await?;
    /// ```
    pub async fn execute(&mut self, query: &str, values: Option<&Params>) -> FastpgResult<u64> {
        let compiled = compile_query(query, values);
        self.settle().await?;
        self.raw
            .execute(&compiled.sql, &compiled.args)
            .await
            .map_err(FastpgError::Driver)
    }

    /// Execute a statement once per value set.
    ///
    /// The whole batch compiles before anything is sent, so a value set
    /// missing a key fails without touching the database.
    pub async fn execute_many(&mut self, query: &str, values: &[Params]) -> FastpgResult<u64> {
        let compiled = compile_many(query, values)?;
        self.settle().await?;
        self.raw
            .execute_many(&compiled.sql, &compiled.args)
            .await
            .map_err(FastpgError::Driver)
    }

    /// First column of the first row.
    pub async fn fetch_value(
        &mut self,
        query: &str,
        values: Option<&Params>,
    ) -> FastpgResult<Option<Value>> {
        let compiled = compile_query(query, values);
        self.settle().await?;
        self.raw
            .fetch_value(&compiled.sql, &compiled.args)
            .await
            .map_err(FastpgError::Driver)
    }

    /// First row, if any.
    pub async fn fetch_one(
        &mut self,
        query: &str,
        values: Option<&Params>,
    ) -> FastpgResult<Option<Record>> {
        let compiled = compile_query(query, values);
        self.settle().await?;
        let row = self
            .raw
            .fetch_row(&compiled.sql, &compiled.args)
            .await
            .map_err(FastpgError::Driver)?;
        Ok(row.map(Record::new))
    }

    /// All rows, possibly none.
    pub async fn fetch_many(
        &mut self,
        query: &str,
        values: Option<&Params>,
    ) -> FastpgResult<Vec<Record>> {
        let compiled = compile_query(query, values);
        self.settle().await?;
        let rows = self
            .raw
            .fetch_all(&compiled.sql, &compiled.args)
            .await
            .map_err(FastpgError::Driver)?;
        Ok(rows.into_iter().map(Record::new).collect())
    }

    /// Bulk-load records with COPY. No placeholders are involved; every
    /// value is coerced in place.
    pub async fn copy_records_to_table(
        &mut self,
        table: &str,
        records: &[Vec<Value>],
        columns: Option<&[&str]>,
    ) -> FastpgResult<u64> {
        let records: Vec<_> = records.iter().map(|r| coerce_row(r)).collect();
        self.settle().await?;
        self.raw
            .copy_records_to_table(table, &records, columns)
            .await
            .map_err(FastpgError::Driver)
    }

    /// Start a transaction scope.
    ///
    /// With `force_rollback` set, even a normal [`Transaction::commit`]
    /// rolls back.
    pub async fn transaction(&mut self, force_rollback: bool) -> FastpgResult<Transaction<'_, C>> {
        Transaction::begin(self, force_rollback).await
    }
}
