//! Decorators that make statement execution observable.
//!
//! [`TracedConnection`] wraps any [`Connection`](crate::driver::Connection)
//! and hands out traced statements. Each execute-family call produces one
//! [`ExecutionRecord`] in the trace store; every other method is forwarded
//! untouched. Driver errors are returned exactly as the driver produced them.

mod connection;
mod prepared;
mod statement;

pub use connection::TracedConnection;
pub use prepared::TracedPreparedStatement;
pub use statement::TracedStatement;

use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::driver::Cancel;
use crate::error::DbError;
use crate::logging::sanitize_sql;
use crate::record::{ExecutionRecord, RecordIdentity};
use crate::store::TraceStore;

/// Everything a traced call needs to create and finish records
#[derive(Clone)]
pub(crate) struct Recorder {
    store: Arc<TraceStore>,
    clock: Arc<dyn Clock>,
    slow_threshold_ms: u64,
    show_executed_sql: bool,
    log_sql_max_len: usize,
    redact_literals: bool,
}

impl Recorder {
    pub(crate) fn new(
        store: Arc<TraceStore>,
        clock: Arc<dyn Clock>,
        slow_threshold_ms: u64,
        show_executed_sql: bool,
        log_sql_max_len: usize,
        redact_literals: bool,
    ) -> Self {
        Self {
            store,
            clock,
            slow_threshold_ms,
            show_executed_sql,
            log_sql_max_len,
            redact_literals,
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Create the record, stamp execute-start and publish it to the store
    pub(crate) fn begin(&self, identity: RecordIdentity, statement: Weak<dyn Cancel>) -> ExecutionGuard {
        let record = Arc::new(ExecutionRecord::new(identity, self.slow_threshold_ms, statement));
        record.mark_started(self.now());

        if let Some(evicted) = self.store.insert_newest(record.clone()) {
            tracing::trace!(
                record_id = %evicted.id(),
                capacity = self.store.capacity(),
                "Trace store full, evicted oldest record"
            );
            crate::metrics::record_evictions("capacity", 1);
        }

        ExecutionGuard {
            record,
            recorder: self.clone(),
            finished: false,
        }
    }

    fn finish(&self, record: &ExecutionRecord, success: bool, failure: Option<&DbError>) {
        if !record.finish(self.now(), success, failure) {
            return;
        }

        let elapsed_ms = record.elapsed_ms().unwrap_or_default();
        crate::metrics::record_execution(
            record.data_source(),
            record.kind(),
            record.is_success(),
            Duration::from_millis(elapsed_ms),
        );

        if self.show_executed_sql {
            tracing::info!(
                record_id = %record.id(),
                data_source = %record.data_source(),
                kind = %record.kind(),
                elapsed_ms,
                success = record.is_success(),
                sql = %sanitize_sql(record.sql(), self.log_sql_max_len, self.redact_literals),
                "Executed SQL"
            );
        }
    }
}

/// Where a traced statement came from
#[derive(Clone)]
pub(crate) struct StatementOrigin {
    pub(crate) data_source: Arc<str>,
    pub(crate) connection_id: Uuid,
    pub(crate) recorder: Recorder,
}

/// Finishes its record exactly once.
///
/// [`complete`](Self::complete) records the call's outcome. If the guard is
/// dropped first (the driver panicked or the caller dropped the execution
/// future) the record is finished as a failure with no cause.
pub(crate) struct ExecutionGuard {
    record: Arc<ExecutionRecord>,
    recorder: Recorder,
    finished: bool,
}

impl ExecutionGuard {
    pub(crate) fn complete<T>(mut self, result: Result<T, DbError>) -> Result<T, DbError> {
        self.finished = true;
        self.recorder
            .finish(&self.record, result.is_ok(), result.as_ref().err());
        result
    }

    #[cfg(test)]
    pub(crate) fn record(&self) -> &Arc<ExecutionRecord> {
        &self.record
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!(
            record_id = %self.record.id(),
            "SQL execution abandoned before completion"
        );
        self.recorder.finish(&self.record, false, None);
    }
}
