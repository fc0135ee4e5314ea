//! SQLite driver over an sqlx pool
//!
//! Each [`SqliteConnection`] owns a single-connection pool so that every
//! statement it creates runs on the same database connection, which keeps
//! `sqlite::memory:` databases intact between statements.
//!
//! Cancellation and query timeouts interrupt SQLite itself through a
//! progress handler, so an interrupted write is rolled back and the
//! connection is free as soon as the caller sees the error.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Statement as _;
use sqlx::{Column, Executor, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::driver::{Cancel, Connection, PreparedStatement, ResultSet, Statement, Value};
use crate::error::DbError;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

pub struct SqliteConnection {
    pool: SqlitePool,
}

impl SqliteConnection {
    /// Open a connection, e.g. `sqlite::memory:` or `sqlite:./data.db`
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        tracing::debug!(database_url, "Opened SQLite connection");
        Ok(Self { pool })
    }

    /// Use an existing pool. Statements may land on different pooled
    /// connections if the pool allows more than one.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    type Statement = SqliteStatement;
    type PreparedStatement = SqlitePreparedStatement;

    async fn create_statement(&self) -> Result<Self::Statement, DbError> {
        if self.pool.is_closed() {
            return Err(DbError::Closed);
        }
        Ok(SqliteStatement {
            pool: self.pool.clone(),
            control: Control::new(),
        })
    }

    async fn prepare_statement(&self, sql: &str) -> Result<Self::PreparedStatement, DbError> {
        if self.pool.is_closed() {
            return Err(DbError::Closed);
        }
        // Surface syntax errors at prepare time
        let prepared = (&self.pool).prepare(sql).await?;
        let columns = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        Ok(SqlitePreparedStatement {
            pool: self.pool.clone(),
            sql: sql.to_string(),
            columns,
            params: Mutex::new(Vec::new()),
            batch: Mutex::new(Vec::new()),
            control: Control::new(),
        })
    }

    async fn prepare_call(&self, _sql: &str) -> Result<Self::PreparedStatement, DbError> {
        Err(DbError::Unsupported(
            "SQLite has no stored procedures".to_string(),
        ))
    }

    async fn is_valid(&self) -> bool {
        !self.pool.is_closed() && sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    async fn close(&self) -> Result<(), DbError> {
        self.pool.close().await;
        Ok(())
    }
}

/// SQLite's result code for a statement stopped by the progress handler
const SQLITE_INTERRUPT: &str = "9";
/// VM instructions between interrupt checks
const PROGRESS_OPS: i32 = 1_000;

const INTERRUPT_CANCELLED: u8 = 1;
const INTERRUPT_TIMED_OUT: u8 = 2;

/// Cancellation, timeout and close state shared by both statement kinds
struct Control {
    cancel: watch::Sender<u64>,
    timeout: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl Control {
    fn new() -> Self {
        let (cancel, _) = watch::channel(0);
        Self {
            cancel,
            timeout: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock().unwrap_or_else(|p| p.into_inner()) = timeout;
    }

    /// Bumping the generation interrupts every execution in flight
    fn cancel(&self) {
        self.cancel.send_modify(|generation| *generation += 1);
    }

    /// Check out the connection and install a progress handler that
    /// interrupts SQLite on cancellation or once the timeout passes.
    async fn arm(&self, pool: &SqlitePool) -> Result<Armed, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        let mut cancelled = self.cancel.subscribe();
        let generation = *cancelled.borrow_and_update();
        let limit = self.timeout();
        let deadline = limit.map(|limit| Instant::now() + limit);

        // Nothing has reached SQLite yet, so abandoning the checkout is safe
        let checkout = async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, pool.acquire()).await {
                    Ok(conn) => conn.map_err(DbError::from),
                    Err(_) => Err(timeout_error(limit)),
                },
                None => pool.acquire().await.map_err(DbError::from),
            }
        };
        let mut conn = tokio::select! {
            conn = checkout => conn?,
            _ = cancelled.changed() => return Err(DbError::Cancelled),
        };

        let reason = Arc::new(AtomicU8::new(0));
        {
            let reason = reason.clone();
            let mut handle = conn.lock_handle().await?;
            handle.set_progress_handler(PROGRESS_OPS, move || {
                if *cancelled.borrow() != generation {
                    reason.store(INTERRUPT_CANCELLED, Ordering::SeqCst);
                    return false;
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    reason.store(INTERRUPT_TIMED_OUT, Ordering::SeqCst);
                    return false;
                }
                true
            });
        }

        Ok(Armed {
            conn,
            reason,
            limit,
        })
    }
}

/// A checked-out connection with the interrupt handler installed
struct Armed {
    conn: PoolConnection<Sqlite>,
    reason: Arc<AtomicU8>,
    limit: Option<Duration>,
}

impl Armed {
    /// Remove the handler and report what SQLite actually did. A statement
    /// that completed before the interrupt landed keeps its result.
    async fn settle<T>(mut self, result: Result<T, sqlx::Error>) -> Result<T, DbError> {
        if let Ok(mut handle) = self.conn.lock_handle().await {
            handle.remove_progress_handler();
        }

        match result {
            Ok(value) => Ok(value),
            Err(err) if is_interrupt(&err) => Err(match self.reason.load(Ordering::SeqCst) {
                INTERRUPT_CANCELLED => DbError::Cancelled,
                INTERRUPT_TIMED_OUT => timeout_error(self.limit.unwrap_or_default()),
                _ => DbError::from(err),
            }),
            Err(err) => Err(DbError::from(err)),
        }
    }
}

fn is_interrupt(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(SQLITE_INTERRUPT))
}

fn timeout_error(limit: Duration) -> DbError {
    DbError::Timeout(format!("query exceeded {}ms", limit.as_millis()))
}

pub struct SqliteStatement {
    pool: SqlitePool,
    control: Control,
}

impl Cancel for SqliteStatement {
    fn cancel(&self) -> Result<(), DbError> {
        self.control.cancel();
        Ok(())
    }
}

#[async_trait]
impl Statement for SqliteStatement {
    async fn execute(&self, sql: &str) -> Result<bool, DbError> {
        let mut armed = self.control.arm(&self.pool).await?;
        if returns_rows(sql) {
            let result = (&mut *armed.conn).fetch_all(sql).await;
            armed.settle(result).await?;
            Ok(true)
        } else {
            let result = (&mut *armed.conn).execute(sql).await;
            armed.settle(result).await?;
            Ok(false)
        }
    }

    async fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError> {
        let mut armed = self.control.arm(&self.pool).await?;
        let result = (&mut *armed.conn).fetch_all(sql).await;
        let rows = armed.settle(result).await?;
        to_result_set(&rows, Vec::new())
    }

    async fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        let mut armed = self.control.arm(&self.pool).await?;
        let result = (&mut *armed.conn).execute(sql).await;
        let done = armed.settle(result).await?;
        Ok(done.rows_affected())
    }

    fn set_query_timeout(&self, timeout: Option<Duration>) {
        self.control.set_timeout(timeout);
    }

    async fn close(&self) -> Result<(), DbError> {
        self.control.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct SqlitePreparedStatement {
    pool: SqlitePool,
    sql: String,
    columns: Vec<String>,
    params: Mutex<Vec<Value>>,
    batch: Mutex<Vec<Vec<Value>>>,
    control: Control,
}

impl SqlitePreparedStatement {
    fn params(&self) -> Vec<Value> {
        self.params.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn query(&self, params: Vec<Value>) -> SqliteQuery<'_> {
        params
            .into_iter()
            .fold(sqlx::query(&self.sql), bind_value)
    }
}

impl Cancel for SqlitePreparedStatement {
    fn cancel(&self) -> Result<(), DbError> {
        self.control.cancel();
        Ok(())
    }
}

#[async_trait]
impl PreparedStatement for SqlitePreparedStatement {
    fn bind(&self, index: usize, value: Value) -> Result<(), DbError> {
        if index == 0 {
            return Err(DbError::Driver("parameter index is 1-based".to_string()));
        }
        let mut params = self.params.lock().unwrap_or_else(|p| p.into_inner());
        if params.len() < index {
            params.resize(index, Value::Null);
        }
        params[index - 1] = value;
        Ok(())
    }

    fn clear_parameters(&self) {
        self.params.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn add_batch(&self) -> Result<(), DbError> {
        let params = self.params();
        self.batch
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(params);
        Ok(())
    }

    async fn execute(&self) -> Result<bool, DbError> {
        let query = self.query(self.params());
        let mut armed = self.control.arm(&self.pool).await?;
        if returns_rows(&self.sql) {
            let result = query.fetch_all(&mut *armed.conn).await;
            armed.settle(result).await?;
            Ok(true)
        } else {
            let result = query.execute(&mut *armed.conn).await;
            armed.settle(result).await?;
            Ok(false)
        }
    }

    async fn execute_query(&self) -> Result<ResultSet, DbError> {
        let query = self.query(self.params());
        let mut armed = self.control.arm(&self.pool).await?;
        let result = query.fetch_all(&mut *armed.conn).await;
        let rows = armed.settle(result).await?;
        to_result_set(&rows, self.columns.clone())
    }

    async fn execute_update(&self) -> Result<u64, DbError> {
        let query = self.query(self.params());
        let mut armed = self.control.arm(&self.pool).await?;
        let result = query.execute(&mut *armed.conn).await;
        let done = armed.settle(result).await?;
        Ok(done.rows_affected())
    }

    async fn execute_batch(&self) -> Result<Vec<u64>, DbError> {
        let sets = std::mem::take(&mut *self.batch.lock().unwrap_or_else(|p| p.into_inner()));

        let mut armed = self.control.arm(&self.pool).await?;
        // An interrupted batch rolls back as a whole
        let result = async {
            let mut tx = sqlx::Connection::begin(&mut *armed.conn).await?;
            let mut counts = Vec::with_capacity(sets.len());
            for params in sets {
                let done = self.query(params).execute(&mut *tx).await?;
                counts.push(done.rows_affected());
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(counts)
        }
        .await;
        armed.settle(result).await
    }

    fn set_query_timeout(&self, timeout: Option<Duration>) {
        self.control.set_timeout(timeout);
    }

    async fn close(&self) -> Result<(), DbError> {
        self.control.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn bind_value(query: SqliteQuery<'_>, value: Value) -> SqliteQuery<'_> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Integer(v) => query.bind(v),
        Value::Real(v) => query.bind(v),
        Value::Text(v) => query.bind(v),
        Value::Blob(v) => query.bind(v),
    }
}

fn to_result_set(rows: &[SqliteRow], mut columns: Vec<String>) -> Result<ResultSet, DbError> {
    if let Some(first) = rows.first() {
        if columns.is_empty() {
            columns = first.columns().iter().map(|c| c.name().to_string()).collect();
        }
    }
    let rows = rows.iter().map(decode_row).collect::<Result<_, _>>()?;
    Ok(ResultSet { columns, rows })
}

fn decode_row(row: &SqliteRow) -> Result<Vec<Value>, DbError> {
    (0..row.len()).map(|i| decode_column(row, i)).collect()
}

/// Decode by the stored value's type, not the column's declared affinity
fn decode_column(row: &SqliteRow, index: usize) -> Result<Value, DbError> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();

    let value = match type_name.as_str() {
        "INTEGER" | "INT8" | "BOOLEAN" => Value::Integer(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => Value::Real(row.try_get_unchecked::<f64, _>(index)?),
        "BLOB" => Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(index)?),
        _ => Value::Text(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

/// Whether `sql` is expected to produce a result set
pub fn returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    matches!(head.as_str(), "SELECT" | "WITH" | "VALUES" | "PRAGMA" | "EXPLAIN")
        || sql.to_ascii_uppercase().contains(" RETURNING ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("  with t as (select 1) select * from t"));
        assert!(returns_rows("(SELECT 1)"));
        assert!(returns_rows("INSERT INTO t (a) VALUES (1) RETURNING id"));
        assert!(!returns_rows("INSERT INTO t (a) VALUES (1)"));
        assert!(!returns_rows("CREATE TABLE t (a INTEGER)"));
        assert!(!returns_rows(""));
    }

    #[tokio::test]
    async fn test_query_decodes_value_types() {
        let conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let stmt = conn.create_statement().await.unwrap();

        let rs = stmt
            .execute_query("SELECT 1 AS i, 2.5 AS r, 'x' AS t, x'0102' AS b, NULL AS n")
            .await
            .unwrap();
        assert_eq!(rs.columns, vec!["i", "r", "t", "b", "n"]);
        assert_eq!(
            rs.rows,
            vec![vec![
                Value::Integer(1),
                Value::Real(2.5),
                Value::Text("x".to_string()),
                Value::Blob(vec![1, 2]),
                Value::Null,
            ]]
        );
    }

    #[tokio::test]
    async fn test_prepare_call_unsupported() {
        let conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        assert!(matches!(
            conn.prepare_call("CALL p()").await,
            Err(DbError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_statement_rejects_execution() {
        let conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let stmt = conn.create_statement().await.unwrap();
        stmt.close().await.unwrap();
        assert_eq!(stmt.execute("SELECT 1").await, Err(DbError::Closed));
    }
}
