use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::alert::{sink_from_config, AlertSink};
use crate::clock::{Clock, SystemClock};
use crate::config::TracerConfig;
use crate::driver::Connection;
use crate::error::TraceError;
use crate::intercept::{Recorder, TracedConnection};
use crate::record::{ExecutionRecord, RecordSnapshot};
use crate::scanner::{self, ScanReport, Scanner, ScannerHandle};
use crate::store::TraceStore;

/// The tracing service.
///
/// Owns the trace store, the scanner and its background task. Clones share
/// the same state. Connections wrapped with [`wrap_connection`] record into
/// this tracer's store for as long as they live.
///
/// [`wrap_connection`]: Self::wrap_connection
#[derive(Clone)]
pub struct SqlTracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    config: TracerConfig,
    store: Arc<TraceStore>,
    clock: Arc<dyn Clock>,
    scanner: Arc<Scanner>,
    recorder: Recorder,
    handle: Mutex<Option<ScannerHandle>>,
}

impl SqlTracer {
    pub fn new(config: TracerConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self::with_clock(config, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TracerConfig, sink: Arc<dyn AlertSink>, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(TraceStore::new(config.max_trace_size));
        let scanner = Arc::new(Scanner::new(
            store.clone(),
            clock.clone(),
            sink,
            config.retention_window_ms,
        ));
        let recorder = Recorder::new(
            store.clone(),
            clock.clone(),
            config.slow_threshold_ms,
            config.show_executed_sql,
            config.log_sql_max_len,
            config.alert.redact_literals,
        );

        Self {
            inner: Arc::new(TracerInner {
                config,
                store,
                clock,
                scanner,
                recorder,
                handle: Mutex::new(None),
            }),
        }
    }

    /// Build a tracer whose alert sink is described by `config.alert`
    pub fn from_config(config: TracerConfig) -> Result<Self, TraceError> {
        let sink = sink_from_config(&config.alert, config.log_sql_max_len)?;
        Ok(Self::new(config, sink))
    }

    pub fn config(&self) -> &TracerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Wrap a driver connection so its statement executions are traced
    pub fn wrap_connection<C: Connection>(&self, conn: C, data_source: &str) -> TracedConnection<C> {
        let connection = TracedConnection::new(conn, Arc::from(data_source), self.inner.recorder.clone());
        tracing::debug!(
            data_source,
            connection_id = %connection.connection_id(),
            "Wrapped connection for tracing"
        );
        connection
    }

    /// Point-in-time copies of every retained execution, newest first
    pub fn trace_snapshot(&self) -> Vec<RecordSnapshot> {
        self.inner
            .store
            .iter_newest_to_oldest()
            .map(|(_, record)| record.snapshot())
            .collect()
    }

    /// Live handles to every retained execution, newest first
    pub fn records(&self) -> Vec<Arc<ExecutionRecord>> {
        self.inner
            .store
            .iter_newest_to_oldest()
            .map(|(_, record)| record)
            .collect()
    }

    pub fn find(&self, id: Uuid) -> Option<Arc<ExecutionRecord>> {
        self.inner.store.find_by_id(id)
    }

    /// Ask the driver to cancel a running execution.
    ///
    /// Returns `true` if a cancellation request reached the driver. Unknown
    /// ids, finished executions and statements the caller already dropped
    /// all return `false`. Driver errors from the cancel request are ignored.
    pub fn cancel_by_id(&self, id: Uuid) -> bool {
        let Some(record) = self.inner.store.find_by_id(id) else {
            return false;
        };
        if !record.is_running() {
            return false;
        }
        let Some(statement) = record.statement() else {
            return false;
        };

        if let Err(e) = statement.cancel() {
            tracing::debug!(record_id = %id, error = %e, "Driver rejected cancel request");
        }
        crate::metrics::record_cancellation();
        tracing::info!(record_id = %id, "Cancellation requested");
        true
    }

    /// Start the periodic scanner on the current tokio runtime
    pub fn start(&self) -> Result<(), TraceError> {
        let mut handle = self.handle();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(TraceError::AlreadyStarted);
        }
        *handle = Some(scanner::spawn(
            self.inner.scanner.clone(),
            self.inner.config.scan_period(),
        )?);
        Ok(())
    }

    /// Stop the scanner task, waiting for an in-progress pass to finish.
    /// Does nothing if it is not running.
    pub async fn stop(&self) {
        let handle = self.handle().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Run one scanner pass now
    pub async fn scan_now(&self) -> ScanReport {
        self.inner.scanner.scan_once().await
    }

    fn handle(&self) -> MutexGuard<'_, Option<ScannerHandle>> {
        self.inner
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
