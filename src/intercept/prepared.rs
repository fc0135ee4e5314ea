use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{ExecutionGuard, StatementOrigin};
use crate::driver::{Cancel, PreparedStatement, ResultSet, Value};
use crate::error::DbError;
use crate::record::{RecordIdentity, StatementKind};

/// Prepared or callable statement whose executions are traced.
///
/// Every execution reuses the SQL text and prepare timing captured when the
/// statement was prepared; each one still gets its own record.
pub struct TracedPreparedStatement<P> {
    inner: Arc<P>,
    origin: StatementOrigin,
    kind: StatementKind,
    sql: String,
    prepare_start_ms: u64,
    prepare_end_ms: u64,
}

impl<P: PreparedStatement> TracedPreparedStatement<P> {
    pub(crate) fn new(
        inner: P,
        origin: StatementOrigin,
        kind: StatementKind,
        sql: &str,
        prepare_start_ms: u64,
        prepare_end_ms: u64,
    ) -> Self {
        Self {
            inner: Arc::new(inner),
            origin,
            kind,
            sql: sql.to_string(),
            prepare_start_ms,
            prepare_end_ms,
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// Time spent preparing, in milliseconds
    pub fn prepare_ms(&self) -> u64 {
        self.prepare_end_ms.saturating_sub(self.prepare_start_ms)
    }

    fn begin(&self) -> ExecutionGuard {
        let statement: Arc<dyn Cancel> = self.inner.clone();
        let statement: Weak<dyn Cancel> = Arc::downgrade(&statement);
        let identity = RecordIdentity {
            data_source: self.origin.data_source.clone(),
            connection_id: self.origin.connection_id,
            kind: self.kind,
            sql: self.sql.clone(),
            prepare_start_ms: self.prepare_start_ms,
            prepare_end_ms: self.prepare_end_ms,
        };
        self.origin.recorder.begin(identity, statement)
    }
}

impl<P: PreparedStatement> Cancel for TracedPreparedStatement<P> {
    fn cancel(&self) -> Result<(), DbError> {
        self.inner.cancel()
    }
}

#[async_trait]
impl<P: PreparedStatement> PreparedStatement for TracedPreparedStatement<P> {
    fn bind(&self, index: usize, value: Value) -> Result<(), DbError> {
        self.inner.bind(index, value)
    }

    fn clear_parameters(&self) {
        self.inner.clear_parameters()
    }

    fn add_batch(&self) -> Result<(), DbError> {
        self.inner.add_batch()
    }

    async fn execute(&self) -> Result<bool, DbError> {
        let guard = self.begin();
        guard.complete(self.inner.execute().await)
    }

    async fn execute_query(&self) -> Result<ResultSet, DbError> {
        let guard = self.begin();
        guard.complete(self.inner.execute_query().await)
    }

    async fn execute_update(&self) -> Result<u64, DbError> {
        let guard = self.begin();
        guard.complete(self.inner.execute_update().await)
    }

    async fn execute_batch(&self) -> Result<Vec<u64>, DbError> {
        let guard = self.begin();
        guard.complete(self.inner.execute_batch().await)
    }

    fn set_query_timeout(&self, timeout: Option<Duration>) {
        self.inner.set_query_timeout(timeout)
    }

    async fn close(&self) -> Result<(), DbError> {
        self.inner.close().await
    }
}
