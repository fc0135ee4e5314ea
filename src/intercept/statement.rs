use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{ExecutionGuard, StatementOrigin};
use crate::driver::{Cancel, ResultSet, Statement};
use crate::error::DbError;
use crate::record::RecordIdentity;

/// Plain statement whose executions are traced.
///
/// The SQL passed to each execute call becomes the record's SQL text.
pub struct TracedStatement<S> {
    inner: Arc<S>,
    origin: StatementOrigin,
}

impl<S: Statement> TracedStatement<S> {
    pub(crate) fn new(inner: S, origin: StatementOrigin) -> Self {
        Self {
            inner: Arc::new(inner),
            origin,
        }
    }

    /// The driver's statement
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn begin(&self, sql: &str) -> ExecutionGuard {
        let statement: Arc<dyn Cancel> = self.inner.clone();
        let statement: Weak<dyn Cancel> = Arc::downgrade(&statement);
        let identity = RecordIdentity::plain(
            self.origin.data_source.clone(),
            self.origin.connection_id,
            sql,
        );
        self.origin.recorder.begin(identity, statement)
    }
}

impl<S: Statement> Cancel for TracedStatement<S> {
    fn cancel(&self) -> Result<(), DbError> {
        self.inner.cancel()
    }
}

#[async_trait]
impl<S: Statement> Statement for TracedStatement<S> {
    async fn execute(&self, sql: &str) -> Result<bool, DbError> {
        let guard = self.begin(sql);
        guard.complete(self.inner.execute(sql).await)
    }

    async fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError> {
        let guard = self.begin(sql);
        guard.complete(self.inner.execute_query(sql).await)
    }

    async fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        let guard = self.begin(sql);
        guard.complete(self.inner.execute_update(sql).await)
    }

    fn set_query_timeout(&self, timeout: Option<Duration>) {
        self.inner.set_query_timeout(timeout)
    }

    async fn close(&self) -> Result<(), DbError> {
        self.inner.close().await
    }
}
