use super::error::{bounded, DbError, PoolRole};
use super::row::{Rows, TimedRow};
use super::transaction::Transaction;
use super::value::{bind_all, Value};
use sqlx::{
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous},
    Connection, Row, SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{info, warn};

/// Readers get at least this many connections, more on bigger machines.
const MIN_READERS: u32 = 4;

/// Knobs for the gateway. The defaults are tuned for a small site on shared
/// hardware, with a little slack so parallel tests don't flake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbOptions {
    /// How long sqlite itself waits on a locked file before reporting SQLITE_BUSY.
    pub busy_timeout: Duration,
    /// Budget for each write, including the wait for the writer slot.
    pub write_timeout: Duration,
    /// Budget for each read.
    pub read_timeout: Duration,
    pub checkpoint_timeout: Duration,
    /// Reader pool size. `None` means max(4, available cores). Zero is
    /// refused at open.
    pub reader_connections: Option<u32>,
    pub writer_max_lifetime: Duration,
    pub reader_max_lifetime: Duration,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(8),
            read_timeout: Duration::from_secs(5),
            checkpoint_timeout: Duration::from_secs(3),
            reader_connections: None,
            writer_max_lifetime: Duration::from_secs(2 * 60),
            reader_max_lifetime: Duration::from_secs(5 * 60),
        }
    }
}

impl DbOptions {
    fn reader_connections(&self) -> u32 {
        self.reader_connections.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
                .unwrap_or(1);
            cores.max(MIN_READERS)
        })
    }
}

/// What `PRAGMA wal_checkpoint(TRUNCATE)` reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// True if the checkpoint couldn't run to completion because of readers
    /// or writers in the way.
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// The app's storage gateway. One writer connection (all mutations and
/// transactions), a pool of read-only connections (everything else), both
/// against the same sqlite file. Build one at startup, hand clones to
/// whatever needs storage, and `close()` it on the way out.
#[derive(Clone, Debug)]
pub struct Gateway {
    writer: SqlitePool,
    reader: SqlitePool,
    // The writer pool is capped at one connection too, but this is the thing
    // that actually queues writers up.
    writer_slot: Arc<Semaphore>,
    opts: DbOptions,
}

/// Whether `path` names sqlite's in-memory database rather than a file.
pub fn is_in_memory(path: &str) -> bool {
    let path = path.trim();
    let rest = path
        .strip_prefix("sqlite:")
        .or_else(|| path.strip_prefix("file:"))
        .unwrap_or(path)
        .trim_start_matches("//");
    rest.starts_with(":memory:")
        || path
            .split_once('?')
            .is_some_and(|(_, query)| query.split('&').any(|kv| kv == "mode=memory"))
}

/// Accepts a bare file path, a `file:` URI, or a sqlx-style `sqlite:` URL.
fn base_connect_options(path: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    if path.starts_with("sqlite:") {
        return SqliteConnectOptions::from_str(path);
    }
    let file = path.strip_prefix("file:").unwrap_or(path);
    let file = file.split('?').next().unwrap_or(file);
    Ok(SqliteConnectOptions::new().filename(file))
}

/// Close a pool, but don't wait forever on connections that never come back
/// (e.g. one held by a transaction somebody forgot to finish). The pool is
/// marked closed either way.
async fn close_pool(pool: &SqlitePool, role: PoolRole, budget: Duration) {
    if tokio::time::timeout(budget, pool.close()).await.is_err() {
        warn!(pool = %role, ?budget, "connections still checked out at close; leaving them behind");
    }
}

async fn ping(pool: &SqlitePool, budget: Duration) -> Result<(), sqlx::Error> {
    let check = async {
        let mut conn = pool.acquire().await?;
        conn.ping().await
    };
    match tokio::time::timeout(budget, check).await {
        Ok(res) => res,
        Err(_) => Err(sqlx::Error::PoolTimedOut),
    }
}

/// Open and ping the read-only pool. The writer has created the file and
/// switched it to WAL by then, so read-only connections attach fine.
async fn open_readers(base: SqliteConnectOptions, opts: &DbOptions) -> Result<SqlitePool, DbError> {
    let readers = opts.reader_connections();
    if readers == 0 {
        return Err(DbError::Open {
            pool: PoolRole::Reader,
            source: sqlx::Error::Configuration("reader pool needs at least one connection".into()),
        });
    }
    let reader_opts = base
        .read_only(true)
        .busy_timeout(opts.busy_timeout)
        .foreign_keys(true);
    let reader_pool: PoolOptions<Sqlite> = PoolOptions::new()
        .max_connections(readers)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(opts.reader_max_lifetime);
    let reader = reader_pool
        .connect_with(reader_opts)
        .await
        .map_err(|source| DbError::Open {
            pool: PoolRole::Reader,
            source,
        })?;
    if let Err(source) = ping(&reader, opts.read_timeout).await {
        reader.close().await;
        return Err(DbError::Ping {
            pool: PoolRole::Reader,
            source,
        });
    }
    Ok(reader)
}

impl Gateway {
    /// Open both pools and make sure they answer. On failure, anything that
    /// was already opened gets closed before the error comes back.
    #[tracing::instrument(skip(opts))]
    pub async fn open(path: &str, opts: DbOptions) -> Result<Self, DbError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(DbError::EmptyPath);
        }
        if is_in_memory(path) {
            return Err(DbError::InMemory(path.to_string()));
        }
        let base = base_connect_options(path).map_err(|source| DbError::Open {
            pool: PoolRole::Writer,
            source,
        })?;

        // Pragmas are set per-connection here, so nothing needs re-applying
        // per operation.
        let writer_opts = base
            .clone()
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal) // usually fine w/ wal
            .busy_timeout(opts.busy_timeout)
            .foreign_keys(true)
            .pragma("automatic_index", "ON")
            .pragma("temp_store", "memory")
            .pragma("cache_size", "-20000")
            .optimize_on_close(true, 400);
        let writer_pool: PoolOptions<Sqlite> = PoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(opts.writer_max_lifetime);
        let writer = writer_pool
            .connect_with(writer_opts)
            .await
            .map_err(|source| DbError::Open {
                pool: PoolRole::Writer,
                source,
            })?;
        if let Err(source) = ping(&writer, opts.write_timeout).await {
            writer.close().await;
            return Err(DbError::Ping {
                pool: PoolRole::Writer,
                source,
            });
        }

        let reader = match open_readers(base, &opts).await {
            Ok(pool) => pool,
            Err(e) => {
                writer.close().await;
                return Err(e);
            }
        };

        info!(path, readers = reader.options().get_max_connections(), "storage gateway open");
        Ok(Self {
            writer,
            reader,
            writer_slot: Arc::new(Semaphore::new(1)),
            opts,
        })
    }

    /// Max connections the reader pool will open.
    pub fn reader_capacity(&self) -> u32 {
        self.reader.options().get_max_connections()
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    async fn writer_slot(&self) -> Result<SemaphorePermit<'_>, DbError> {
        // The semaphore only closes when the gateway does.
        self.writer_slot
            .acquire()
            .await
            .map_err(|_| DbError::Sql(sqlx::Error::PoolClosed))
    }

    /// Run a write statement on the writer connection, auto-committed.
    /// Returns rows affected.
    #[tracing::instrument(skip(self, params))]
    pub async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        bounded("exec", self.opts.write_timeout, async {
            let _slot = self.writer_slot().await?;
            let done = bind_all(sqlx::query(sql), params)
                .execute(&self.writer)
                .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    /// Run a query on the reader pool.
    #[tracing::instrument(skip(self, params))]
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Rows, DbError> {
        bounded("query", self.opts.read_timeout, async {
            let rows = bind_all(sqlx::query(sql), params)
                .fetch_all(&self.reader)
                .await?;
            Ok(Rows::new(rows))
        })
        .await
    }

    /// Single-row query on the reader pool. The timeout starts now, but stays
    /// open until you read the row or check its error; see [`TimedRow`].
    pub fn query_row(&self, sql: &str, params: &[Value]) -> TimedRow<'_> {
        let sql = sql.to_string();
        let params = params.to_vec();
        TimedRow::start("query_row", self.opts.read_timeout, async move {
            let row = bind_all(sqlx::query(&sql), &params)
                .fetch_optional(&self.reader)
                .await?;
            Ok(row)
        })
    }

    /// Run a query on the writer connection instead of the readers. This
    /// waits its turn behind any open transaction, so it sees the latest
    /// committed state and never somebody else's uncommitted writes.
    #[tracing::instrument(skip(self, params))]
    pub async fn query_on_writer(&self, sql: &str, params: &[Value]) -> Result<Rows, DbError> {
        bounded("query_on_writer", self.opts.read_timeout, async {
            let _slot = self.writer_slot().await?;
            let rows = bind_all(sqlx::query(sql), params)
                .fetch_all(&self.writer)
                .await?;
            Ok(Rows::new(rows))
        })
        .await
    }

    /// Start a write transaction. Deliberately unbounded: waiting on the
    /// writer slot and BEGIN IMMEDIATE have no timeout, only the statements
    /// inside do. A timeout here could tear the transaction down before the
    /// caller ever got to use it.
    #[tracing::instrument(skip(self))]
    pub async fn begin_transaction(&self) -> Result<Transaction, DbError> {
        let slot = self
            .writer_slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DbError::Sql(sqlx::Error::PoolClosed))?;
        let mut conn = self.writer.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Transaction::new(conn, slot, self.opts))
    }

    /// Fold the WAL back into the main file and truncate it.
    #[tracing::instrument(skip(self))]
    pub async fn checkpoint(&self) -> Result<CheckpointStats, DbError> {
        bounded("checkpoint", self.opts.checkpoint_timeout, async {
            let _slot = self.writer_slot().await?;
            let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .fetch_one(&self.writer)
                .await?;
            Ok(CheckpointStats {
                busy: row.try_get::<i64, _>(0)? != 0,
                log_frames: row.try_get(1)?,
                checkpointed_frames: row.try_get(2)?,
            })
        })
        .await
    }

    /// Best-effort checkpoint, then shut both pools. A failed checkpoint is
    /// logged and otherwise ignored; shutdown goes ahead regardless. Closing
    /// a gateway whose pools are already closed (through another clone) does
    /// nothing.
    pub async fn close(self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.checkpoint().await {
            warn!("wal checkpoint on close failed: {}", e);
        }
        self.writer_slot.close();
        close_pool(&self.reader, PoolRole::Reader, self.opts.read_timeout).await;
        close_pool(&self.writer, PoolRole::Writer, self.opts.write_timeout).await;
        info!("storage gateway closed");
    }

    #[cfg(test)]
    pub(crate) fn reader_pool(&self) -> &SqlitePool {
        &self.reader
    }

    #[cfg(test)]
    pub(crate) fn writer_pool(&self) -> &SqlitePool {
        &self.writer
    }
}

// Test stuff, kept a lil separate from the main stuff.
impl Gateway {
    /// A gateway on a fresh file in a temp dir, with the app schema applied.
    /// Keep the TempDir alive for as long as you need the database.
    #[cfg(test)]
    pub async fn new_test_db() -> (tempfile::TempDir, Self) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Self::open(path.to_str().unwrap(), DbOptions::default())
            .await
            .unwrap();
        super::apply_schema(&db)
            .await
            .expect("schema should apply to a fresh database");
        (dir, db)
    }
}
