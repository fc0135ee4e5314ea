use async_trait::async_trait;
use sql_tracer::driver::{Cancel, Connection, PreparedStatement, ResultSet, Statement, Value};
use sql_tracer::{DbError, ManualClock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Clock time spent in every prepare call
pub const PREPARE_MS: u64 = 5;

/// Scripted driver. Behaviour is chosen by the SQL text:
///
/// - `SLEEP <ms>`: advances the manual clock by `<ms>` and succeeds
/// - `FAIL TIMEOUT`: returns `DbError::Timeout`
/// - `FAIL SQL`: returns `DbError::Sql` with state `42000`
/// - `BLOCK`: waits until the statement is cancelled
/// - `PANIC`: panics inside the driver
/// - `FAIL PREPARE` (prepare only): prepare fails
/// - anything else succeeds immediately
#[derive(Clone)]
pub struct MockConnection {
    clock: Arc<ManualClock>,
    stats: Arc<MockStats>,
}

#[derive(Default)]
pub struct MockStats {
    pub cancels: AtomicUsize,
    pub executions: AtomicUsize,
    pub closed: AtomicBool,
}

impl MockConnection {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    fn script(&self) -> Script {
        Script {
            clock: self.clock.clone(),
            stats: self.stats.clone(),
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }
}

struct Script {
    clock: Arc<ManualClock>,
    stats: Arc<MockStats>,
    cancelled: AtomicBool,
    wake: Notify,
}

impl Script {
    async fn run(&self, sql: &str) -> Result<(), DbError> {
        self.stats.executions.fetch_add(1, Ordering::SeqCst);
        let sql = sql.trim();

        if let Some(ms) = sql.strip_prefix("SLEEP ") {
            let ms: u64 = ms.trim().parse().map_err(|_| DbError::Driver(format!("bad sleep: {}", ms)))?;
            self.clock.advance(ms);
            return Ok(());
        }

        match sql {
            "FAIL TIMEOUT" => Err(DbError::Timeout("query timed out".to_string())),
            "FAIL SQL" => Err(DbError::Sql {
                state: Some("42000".to_string()),
                message: "syntax error".to_string(),
            }),
            "BLOCK" => loop {
                let woken = self.wake.notified();
                if self.cancelled.load(Ordering::SeqCst) {
                    return Err(DbError::Cancelled);
                }
                woken.await;
            },
            "PANIC" => panic!("driver exploded"),
            _ => Ok(()),
        }
    }

    fn cancel(&self) {
        self.stats.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }
}

pub struct MockStatement {
    script: Script,
}

impl Cancel for MockStatement {
    fn cancel(&self) -> Result<(), DbError> {
        self.script.cancel();
        Ok(())
    }
}

#[async_trait]
impl Statement for MockStatement {
    async fn execute(&self, sql: &str) -> Result<bool, DbError> {
        self.script.run(sql).await?;
        Ok(false)
    }

    async fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError> {
        self.script.run(sql).await?;
        Ok(ResultSet {
            columns: vec!["n".to_string()],
            rows: vec![vec![Value::Integer(1)]],
        })
    }

    async fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        self.script.run(sql).await?;
        Ok(1)
    }

    fn set_query_timeout(&self, _timeout: Option<Duration>) {}

    async fn close(&self) -> Result<(), DbError> {
        Ok(())
    }
}

pub struct MockPreparedStatement {
    sql: String,
    script: Script,
    params: Mutex<Vec<Value>>,
    batch: Mutex<Vec<Vec<Value>>>,
}

impl MockPreparedStatement {
    pub fn params(&self) -> Vec<Value> {
        self.params.lock().unwrap().clone()
    }
}

impl Cancel for MockPreparedStatement {
    fn cancel(&self) -> Result<(), DbError> {
        self.script.cancel();
        Ok(())
    }
}

#[async_trait]
impl PreparedStatement for MockPreparedStatement {
    fn bind(&self, index: usize, value: Value) -> Result<(), DbError> {
        let mut params = self.params.lock().unwrap();
        if params.len() < index {
            params.resize(index, Value::Null);
        }
        params[index - 1] = value;
        Ok(())
    }

    fn clear_parameters(&self) {
        self.params.lock().unwrap().clear();
    }

    fn add_batch(&self) -> Result<(), DbError> {
        let params = self.params();
        self.batch.lock().unwrap().push(params);
        Ok(())
    }

    async fn execute(&self) -> Result<bool, DbError> {
        self.script.run(&self.sql).await?;
        Ok(false)
    }

    async fn execute_query(&self) -> Result<ResultSet, DbError> {
        self.script.run(&self.sql).await?;
        Ok(ResultSet::default())
    }

    async fn execute_update(&self) -> Result<u64, DbError> {
        self.script.run(&self.sql).await?;
        Ok(1)
    }

    async fn execute_batch(&self) -> Result<Vec<u64>, DbError> {
        let sets = std::mem::take(&mut *self.batch.lock().unwrap());
        self.script.run(&self.sql).await?;
        Ok(vec![1; sets.len()])
    }

    fn set_query_timeout(&self, _timeout: Option<Duration>) {}

    async fn close(&self) -> Result<(), DbError> {
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    type Statement = MockStatement;
    type PreparedStatement = MockPreparedStatement;

    async fn create_statement(&self) -> Result<Self::Statement, DbError> {
        Ok(MockStatement {
            script: self.script(),
        })
    }

    async fn prepare_statement(&self, sql: &str) -> Result<Self::PreparedStatement, DbError> {
        self.clock.advance(PREPARE_MS);
        if sql == "FAIL PREPARE" {
            return Err(DbError::Sql {
                state: Some("42601".to_string()),
                message: "cannot prepare".to_string(),
            });
        }
        Ok(MockPreparedStatement {
            sql: sql.to_string(),
            script: self.script(),
            params: Mutex::new(Vec::new()),
            batch: Mutex::new(Vec::new()),
        })
    }

    async fn prepare_call(&self, sql: &str) -> Result<Self::PreparedStatement, DbError> {
        self.prepare_statement(sql).await
    }

    async fn is_valid(&self) -> bool {
        !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.stats.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DbError> {
        self.stats.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
