use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::alert::AlertSink;
use crate::clock::Clock;
use crate::error::TraceError;
use crate::record::ExecutionRecord;
use crate::store::TraceStore;

/// Outcome of one scanner pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Another pass was already running; nothing was done
    pub skipped: bool,
    pub scanned: usize,
    /// Running executions newly flagged slow
    pub marked_slow: usize,
    /// Records handed to the alert sink
    pub alerted: usize,
    /// Records removed for being past the retention window
    pub evicted: usize,
    /// Records removed to bring the store back within capacity
    pub trimmed: usize,
}

/// Single-pass slow detection, alert batching and eviction over a
/// [`TraceStore`].
///
/// Passes never overlap: a pass that starts while another is in progress
/// returns immediately with [`ScanReport::skipped`] set.
pub struct Scanner {
    store: Arc<TraceStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn AlertSink>,
    retention_window_ms: u64,
    running: AtomicBool,
}

/// Clears the running flag even if a pass unwinds
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Scanner {
    pub fn new(
        store: Arc<TraceStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AlertSink>,
        retention_window_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            retention_window_ms,
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    /// Run one pass over the store
    pub async fn scan_once(&self) -> ScanReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Scanner pass already in progress, skipping");
            return ScanReport {
                skipped: true,
                ..ScanReport::default()
            };
        }
        let _guard = PassGuard(&self.running);

        let started = Instant::now();
        let now = self.clock.now_millis();
        let mut report = ScanReport::default();
        let mut batch = Vec::new();

        for (seq, record) in self.store.iter_oldest_to_newest() {
            report.scanned += 1;

            if record.is_overdue(now) && record.mark_slow_provisional() {
                report.marked_slow += 1;
                tracing::debug!(
                    record_id = %record.id(),
                    running_ms = record.running_ms(now),
                    "Running SQL execution passed slow threshold"
                );
            }

            if record.needs_alert() && record.try_mark_alerted() {
                batch.push(record.clone());
            }

            if self.is_expired(&record, now) {
                let retention = self.retention_window_ms;
                let removed = self.store.remove_if(seq, |r| {
                    r.execute_end_ms()
                        .is_some_and(|end| now.saturating_sub(end) >= retention)
                });
                if removed.is_some() {
                    report.evicted += 1;
                }
            }
        }

        report.trimmed = self.store.enforce_capacity().len();
        report.alerted = batch.len();

        crate::metrics::record_provisional_slow(report.marked_slow as u64);
        crate::metrics::record_evictions("retention", report.evicted as u64);
        crate::metrics::record_evictions("capacity", report.trimmed as u64);
        crate::metrics::update_store_size(self.store.len());

        if !batch.is_empty() {
            crate::metrics::record_alerts(batch.len() as u64);
            self.dispatch(batch).await;
        }

        crate::metrics::record_scan_duration(started.elapsed());
        tracing::trace!(
            scanned = report.scanned,
            marked_slow = report.marked_slow,
            alerted = report.alerted,
            evicted = report.evicted,
            trimmed = report.trimmed,
            "Scanner pass complete"
        );
        report
    }

    fn is_expired(&self, record: &ExecutionRecord, now: u64) -> bool {
        record
            .execute_end_ms()
            .is_some_and(|end| now.saturating_sub(end) >= self.retention_window_ms)
    }

    /// Hand the batch to the sink. Sink errors and panics stop here.
    async fn dispatch(&self, batch: Vec<Arc<ExecutionRecord>>) {
        let batch_size = batch.len();
        let result = std::panic::AssertUnwindSafe(self.sink.send(&batch))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {
                tracing::debug!(batch_size, "Alert batch sent");
            }
            Ok(Err(e)) => {
                crate::metrics::record_alert_failure();
                tracing::error!(batch_size, error = %e, "Alert sink failed, batch dropped");
            }
            Err(panic) => {
                crate::metrics::record_alert_failure();
                tracing::error!(batch_size, panic = ?panic, "Alert sink panicked, batch dropped");
            }
        }
    }
}

/// Periodic scanner task. Stop it with [`stop`](Self::stop); dropping the
/// handle aborts the task.
pub struct ScannerHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ScannerHandle {
    /// Signal the task and wait for any in-progress pass to finish
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Scanner task panicked");
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for ScannerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start running `scanner` every `period` on the current tokio runtime.
///
/// The first pass happens one full period after start. Ticks missed while
/// a pass is running are skipped rather than bunched up.
pub fn spawn(scanner: Arc<Scanner>, period: Duration) -> Result<ScannerHandle, TraceError> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| TraceError::NoRuntime)?;
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = runtime.spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval() completes its first tick immediately
        ticker.tick().await;

        tracing::info!(period_ms = period.as_millis() as u64, "SQL trace scanner started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    scanner.scan_once().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("SQL trace scanner stopped");
    });

    Ok(ScannerHandle {
        shutdown,
        task: Some(task),
    })
}
