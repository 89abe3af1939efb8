use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which of the gateway's two pools an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    Writer,
    Reader,
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRole::Writer => f.write_str("writer"),
            PoolRole::Reader => f.write_str("reader"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database path required")]
    EmptyPath,

    // Every connection to an in-memory database gets its own private copy, so
    // the writer and the readers would never see each other's data.
    #[error("in-memory databases aren't supported, the gateway needs a file: {0:?}")]
    InMemory(String),

    #[error("couldn't open {pool} pool: {source}")]
    Open {
        pool: PoolRole,
        #[source]
        source: sqlx::Error,
    },

    #[error("{pool} pool failed its connectivity check: {source}")]
    Ping {
        pool: PoolRole,
        #[source]
        source: sqlx::Error,
    },

    #[error("{op} timed out after {budget:?}")]
    Timeout { op: &'static str, budget: Duration },

    #[error("no rows in result set")]
    NoRows,

    #[error("no active transaction")]
    NoActiveTransaction,

    // Engine errors (constraint violations, syntax errors, etc.) pass
    // through untouched.
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

impl DbError {
    /// Timeouts are the only thing worth retrying; the gateway never does it
    /// on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Timeout { .. })
    }

    pub fn is_no_rows(&self) -> bool {
        matches!(self, DbError::NoRows | DbError::Sql(sqlx::Error::RowNotFound))
    }

    /// The engine's error code, if this came out of sqlite itself.
    pub fn sqlite_code(&self) -> Option<String> {
        match self {
            DbError::Sql(sqlx::Error::Database(dbe)) => dbe.code().map(|c| c.into_owned()),
            _ => None,
        }
    }
}

/// Wrap one operation in its own timeout scope.
pub(crate) async fn bounded<T, F>(op: &'static str, budget: Duration, fut: F) -> Result<T, DbError>
where
    F: std::future::Future<Output = Result<T, DbError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(res) => res,
        Err(_) => Err(DbError::Timeout { op, budget }),
    }
}
