//! Transaction scopes.

use std::ops::{Deref, DerefMut};

use crate::connection::Connection;
use crate::driver::DriverConnection;
use crate::error::FastpgResult;

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Started,
    Committed,
    RolledBack,
}

/// A started transaction borrowing its connection.
///
/// Derefs to [`Connection`], so queries issued through it run inside the
/// transaction. Finishing is explicit:
///
/// - [`commit`](Transaction::commit) is the normal exit. It commits, or
///   rolls back when the scope was opened with `force_rollback`.
/// - [`rollback`](Transaction::rollback) always rolls back.
///
/// A transaction dropped while still started (an early `?` return, a
/// panic, a cancelled future) queues a rollback on the connection, which
/// runs before the connection's next operation or on release. The error
/// that caused the exit is what reaches the caller.
///
/// ```ignore
/// let mut tx = conn.transaction(false).await?;
/// tx.execute("INSERT INTO audit (msg) VALUES (:msg)", Some(&params)).await?;
/// tx.commit().await?;
/// ```
pub struct Transaction<'c, C: DriverConnection> {
    conn: &'c mut Connection<C>,
    force_rollback: bool,
    state: TransactionState,
}

impl<'c, C: DriverConnection> Transaction<'c, C> {
    pub(crate) async fn begin(conn: &'c mut Connection<C>, force_rollback: bool) -> FastpgResult<Self> {
        conn.begin_raw().await?;
        tracing::debug!(force_rollback, "transaction started");
        Ok(Self {
            conn,
            force_rollback,
            state: TransactionState::Started,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_force_rollback(&self) -> bool {
        self.force_rollback
    }

    /// Normal exit. Returns the terminal state actually reached.
    pub async fn commit(mut self) -> FastpgResult<TransactionState> {
        // Nested scopes dropped on an error path are undone before this one
        // ends; if that fails, the scope is still open and Drop queues it.
        self.conn.settle().await?;
        let (result, state) = if self.force_rollback {
            (self.conn.rollback_raw().await, TransactionState::RolledBack)
        } else {
            (self.conn.commit_raw().await, TransactionState::Committed)
        };
        // The server ends the transaction even when COMMIT fails.
        self.state = state;
        result?;
        tracing::debug!(?state, "transaction finished");
        Ok(state)
    }

    /// Abandon every change made in this scope.
    pub async fn rollback(mut self) -> FastpgResult<()> {
        self.conn.settle().await?;
        let result = self.conn.rollback_raw().await;
        self.state = TransactionState::RolledBack;
        result
    }
}

impl<C: DriverConnection> Deref for Transaction<'_, C> {
    type Target = Connection<C>;

    fn deref(&self) -> &Self::Target {
        self.conn
    }
}

impl<C: DriverConnection> DerefMut for Transaction<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
    }
}

impl<C: DriverConnection> Drop for Transaction<'_, C> {
    fn drop(&mut self) {
        if self.state == TransactionState::Started {
            tracing::debug!("transaction dropped while open; rollback queued");
            self.conn.queue_rollback();
        }
    }
}
