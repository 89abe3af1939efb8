//! Result types handed back by the gateway.
//!
//! Multi-row queries are materialized inside their timeout and come back as
//! a plain [`Rows`] cursor, so nothing outlives the scope. Single-row queries
//! are different: the caller usually wants to decode the value right away,
//! and cancelling the timeout scope before that happens would turn a perfectly
//! good result into a spurious cancellation. So [`TimedRow`] carries the scope
//! along and releases it exactly once, whichever way the handle ends up being
//! used (or not used).

use super::error::DbError;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Decode, FromRow, Row, Type};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

type RowFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<SqliteRow>, DbError>> + Send + 'a>>;

/// A forward-only cursor over the rows a query returned.
pub struct Rows {
    inner: std::vec::IntoIter<SqliteRow>,
}

impl Rows {
    pub(crate) fn new(rows: Vec<SqliteRow>) -> Self {
        Self {
            inner: rows.into_iter(),
        }
    }

    /// Decode the next row as `T`, or `Ok(None)` once the cursor is spent.
    pub fn scan_next<T>(&mut self) -> Result<Option<T>, DbError>
    where
        T: for<'r> FromRow<'r, SqliteRow>,
    {
        match self.inner.next() {
            Some(row) => Ok(Some(T::from_row(&row)?)),
            None => Ok(None),
        }
    }
}

impl Iterator for Rows {
    type Item = SqliteRow;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Rows {}

impl fmt::Debug for Rows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rows")
            .field("remaining", &self.inner.len())
            .finish()
    }
}

enum RowState<'a> {
    Pending(RowFuture<'a>),
    Ready(Result<Option<SqliteRow>, DbError>),
    Taken,
}

/// A single-row query plus its still-open timeout scope.
///
/// The scope's clock starts when the handle is created. It's released by
/// the first of: [`scan`](Self::scan) / [`row`](Self::row), [`err`](Self::err),
/// or dropping the handle. Dropping an unread handle also drops the
/// in-flight query along with its timer.
pub struct TimedRow<'a> {
    state: RowState<'a>,
    released: bool,
}

impl<'a> TimedRow<'a> {
    pub(crate) fn start<F>(op: &'static str, budget: Duration, fetch: F) -> Self
    where
        F: Future<Output = Result<Option<SqliteRow>, DbError>> + Send + 'a,
    {
        let deadline = tokio::time::Instant::now() + budget;
        let fut = async move {
            tokio::time::timeout_at(deadline, fetch)
                .await
                .unwrap_or(Err(DbError::Timeout { op, budget }))
        };
        Self {
            state: RowState::Pending(Box::pin(fut)),
            released: false,
        }
    }

    /// A handle that already knows it failed, e.g. because its transaction
    /// was resolved. There's no scope to release.
    pub(crate) fn failed(err: DbError) -> Self {
        Self {
            state: RowState::Ready(Err(err)),
            released: true,
        }
    }

    /// Drive the query to completion (if it hasn't been already) and release
    /// the scope.
    async fn resolve(&mut self) {
        if let RowState::Pending(fut) = &mut self.state {
            let res = fut.await;
            self.state = RowState::Ready(res);
        }
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let RowState::Pending(_) = self.state {
            self.state = RowState::Taken;
        }
    }

    /// Whether the timeout scope has been released yet.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Report the query's error, if any, without consuming the row. An empty
    /// result is not an error here; that only shows up when you ask for the row.
    pub async fn err(&mut self) -> Option<&DbError> {
        self.resolve().await;
        match &self.state {
            RowState::Ready(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// Take the row. Zero rows is [`DbError::NoRows`].
    pub async fn row(mut self) -> Result<SqliteRow, DbError> {
        self.resolve().await;
        match std::mem::replace(&mut self.state, RowState::Taken) {
            RowState::Ready(Ok(Some(row))) => Ok(row),
            RowState::Ready(Err(e)) => Err(e),
            RowState::Ready(Ok(None)) | RowState::Taken | RowState::Pending(_) => {
                Err(DbError::NoRows)
            }
        }
    }

    /// Take the row and decode it, e.g. into a `#[derive(FromRow)]` struct or
    /// a tuple.
    pub async fn scan<T>(self) -> Result<T, DbError>
    where
        T: for<'r> FromRow<'r, SqliteRow>,
    {
        let row = self.row().await?;
        Ok(T::from_row(&row)?)
    }

    /// Take the row and decode its first column.
    pub async fn scan_one<T>(self) -> Result<T, DbError>
    where
        T: for<'r> Decode<'r, Sqlite> + Type<Sqlite>,
    {
        let row = self.row().await?;
        Ok(row.try_get(0)?)
    }
}

impl Drop for TimedRow<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for TimedRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            RowState::Pending(_) => "pending",
            RowState::Ready(Ok(_)) => "ready",
            RowState::Ready(Err(_)) => "failed",
            RowState::Taken => "taken",
        };
        f.debug_struct("TimedRow")
            .field("state", &state)
            .field("released", &self.is_released())
            .finish()
    }
}
