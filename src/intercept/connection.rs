use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use super::{Recorder, StatementOrigin, TracedPreparedStatement, TracedStatement};
use crate::driver::Connection;
use crate::error::DbError;
use crate::record::StatementKind;

/// Connection decorator. Statements it creates are traced; everything else
/// is forwarded to the wrapped connection.
pub struct TracedConnection<C> {
    inner: C,
    origin: StatementOrigin,
}

impl<C: Connection> TracedConnection<C> {
    pub(crate) fn new(inner: C, data_source: Arc<str>, recorder: Recorder) -> Self {
        Self {
            inner,
            origin: StatementOrigin {
                data_source,
                connection_id: Uuid::new_v4(),
                recorder,
            },
        }
    }

    /// Identifier stamped on every record from this connection
    pub fn connection_id(&self) -> Uuid {
        self.origin.connection_id
    }

    pub fn data_source(&self) -> &str {
        &self.origin.data_source
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Unwrap, returning the driver's connection
    pub fn into_inner(self) -> C {
        self.inner
    }

    fn prepared<P>(&self, inner: P, kind: StatementKind, sql: &str, prepare_start_ms: u64) -> TracedPreparedStatement<P>
    where
        P: crate::driver::PreparedStatement,
    {
        let prepare_end_ms = self.origin.recorder.now();
        tracing::trace!(
            connection_id = %self.origin.connection_id,
            kind = %kind,
            prepare_ms = prepare_end_ms.saturating_sub(prepare_start_ms),
            "Statement prepared"
        );
        TracedPreparedStatement::new(inner, self.origin.clone(), kind, sql, prepare_start_ms, prepare_end_ms)
    }
}

#[async_trait]
impl<C: Connection> Connection for TracedConnection<C> {
    type Statement = TracedStatement<C::Statement>;
    type PreparedStatement = TracedPreparedStatement<C::PreparedStatement>;

    async fn create_statement(&self) -> Result<Self::Statement, DbError> {
        let inner = self.inner.create_statement().await?;
        Ok(TracedStatement::new(inner, self.origin.clone()))
    }

    async fn prepare_statement(&self, sql: &str) -> Result<Self::PreparedStatement, DbError> {
        let prepare_start_ms = self.origin.recorder.now();
        let inner = self.inner.prepare_statement(sql).await?;
        Ok(self.prepared(inner, StatementKind::Prepared, sql, prepare_start_ms))
    }

    async fn prepare_call(&self, sql: &str) -> Result<Self::PreparedStatement, DbError> {
        let prepare_start_ms = self.origin.recorder.now();
        let inner = self.inner.prepare_call(sql).await?;
        Ok(self.prepared(inner, StatementKind::Callable, sql, prepare_start_ms))
    }

    async fn is_valid(&self) -> bool {
        self.inner.is_valid().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn close(&self) -> Result<(), DbError> {
        self.inner.close().await
    }
}
