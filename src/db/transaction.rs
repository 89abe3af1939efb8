use super::error::{bounded, DbError};
use super::gateway::DbOptions;
use super::row::{Rows, TimedRow};
use super::value::{bind_all, Value};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnection};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{error, warn};

/// Where a [`Transaction`] is in its life. `Committed` and `RolledBack` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// A write transaction on the gateway's single writer connection. It holds
/// the writer slot for as long as it's open, so there's never more than one.
///
/// Statements get the usual per-operation timeouts; the transaction itself
/// never times out. Only `commit` or `rollback` ends it. If one gets dropped
/// while still open, its connection is thrown away instead of going back to
/// the pool, which makes sqlite roll it back.
pub struct Transaction {
    // Field order matters for drop: connection goes back before the slot frees up.
    conn: Option<PoolConnection<Sqlite>>,
    slot: Option<OwnedSemaphorePermit>,
    state: TxState,
    opts: DbOptions,
}

impl Transaction {
    pub(crate) fn new(conn: PoolConnection<Sqlite>, slot: OwnedSemaphorePermit, opts: DbOptions) -> Self {
        Self {
            conn: Some(conn),
            slot: Some(slot),
            state: TxState::Open,
            opts,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection, DbError> {
        match (self.state, self.conn.as_mut()) {
            (TxState::Open, Some(conn)) => Ok(&mut **conn),
            _ => Err(DbError::NoActiveTransaction),
        }
    }

    /// Run a write statement inside the transaction. Returns rows affected.
    #[tracing::instrument(skip(self, params))]
    pub async fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let budget = self.opts.write_timeout;
        let conn = self.conn()?;
        bounded("transaction exec", budget, async move {
            let done = bind_all(sqlx::query(sql), params).execute(conn).await?;
            Ok(done.rows_affected())
        })
        .await
    }

    /// Run a query inside the transaction; sees the transaction's own writes.
    #[tracing::instrument(skip(self, params))]
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows, DbError> {
        let budget = self.opts.read_timeout;
        let conn = self.conn()?;
        bounded("transaction query", budget, async move {
            let rows = bind_all(sqlx::query(sql), params).fetch_all(conn).await?;
            Ok(Rows::new(rows))
        })
        .await
    }

    /// Single-row query inside the transaction. See [`TimedRow`] for how the
    /// timeout scope is handled.
    pub fn query_row(&mut self, sql: &str, params: &[Value]) -> TimedRow<'_> {
        let budget = self.opts.read_timeout;
        let conn = match self.conn() {
            Ok(conn) => conn,
            Err(e) => return TimedRow::failed(e),
        };
        let sql = sql.to_string();
        let params = params.to_vec();
        TimedRow::start("transaction query_row", budget, async move {
            let row = bind_all(sqlx::query(&sql), &params)
                .fetch_optional(conn)
                .await?;
            Ok(row)
        })
    }

    /// Finalize the transaction. If COMMIT fails, we roll back before
    /// reporting the commit error. Either way the transaction is finished
    /// afterwards, and committing it again is an error.
    #[tracing::instrument(skip(self))]
    pub async fn commit(&mut self) -> Result<(), DbError> {
        if self.state != TxState::Open {
            return Err(DbError::NoActiveTransaction);
        }
        let Some(mut conn) = self.conn.take() else {
            self.state = TxState::RolledBack;
            return Err(DbError::NoActiveTransaction);
        };
        match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => {
                self.state = TxState::Committed;
                drop(conn);
                self.slot = None;
                Ok(())
            }
            Err(commit_err) => {
                self.state = TxState::RolledBack;
                if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    error!("rollback after failed commit also failed: {}", e);
                    // don't hand a connection with who-knows-what state back to the pool.
                    drop(conn.detach());
                } else {
                    drop(conn);
                }
                self.slot = None;
                Err(commit_err.into())
            }
        }
    }

    /// Abort the transaction. Rolling back something that's already finished
    /// is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn rollback(&mut self) -> Result<(), DbError> {
        if self.state != TxState::Open {
            return Ok(());
        }
        self.state = TxState::RolledBack;
        let Some(mut conn) = self.conn.take() else {
            self.slot = None;
            return Ok(());
        };
        let res = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        if res.is_err() {
            drop(conn.detach());
        } else {
            drop(conn);
        }
        self.slot = None;
        res.map(|_| ()).map_err(DbError::from)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("holds_writer_slot", &self.slot.is_some())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("transaction dropped while still open; discarding its connection");
            // Closing the connection rolls back whatever was in flight.
            drop(conn.detach());
        }
    }
}
