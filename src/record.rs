use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use uuid::Uuid;

use crate::driver::Cancel;
use crate::error::DbError;
use crate::logging::format_millis;

/// How the traced statement was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    /// SQL supplied on each execute call
    Plain,
    /// SQL bound at prepare time
    Prepared,
    /// Stored-procedure call bound at prepare time
    Callable,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Prepared => "prepared",
            Self::Callable => "callable",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of one execution
#[derive(Debug, Clone)]
pub struct RecordIdentity {
    pub data_source: Arc<str>,
    pub connection_id: Uuid,
    pub kind: StatementKind,
    pub sql: String,
    /// 0 when the statement was not prepared
    pub prepare_start_ms: u64,
    pub prepare_end_ms: u64,
}

impl RecordIdentity {
    /// Identity for a plain statement execution
    pub fn plain(data_source: impl Into<Arc<str>>, connection_id: Uuid, sql: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            connection_id,
            kind: StatementKind::Plain,
            sql: sql.into(),
            prepare_start_ms: 0,
            prepare_end_ms: 0,
        }
    }
}

/// Stand-in target for records that have no live statement
struct Detached;

impl Cancel for Detached {
    fn cancel(&self) -> Result<(), DbError> {
        Ok(())
    }
}

/// One traced statement execution.
///
/// Identity fields are fixed at construction. Lifecycle fields are atomics
/// written by the executing task (start, outcome) and by the scanner
/// (provisional slow flag, alerted flag). Timestamps are milliseconds from
/// the tracer's [`Clock`](crate::clock::Clock); zero means "not yet".
pub struct ExecutionRecord {
    id: Uuid,
    identity: RecordIdentity,
    slow_threshold_ms: u64,

    execute_start_ms: AtomicU64,
    execute_end_ms: AtomicU64,
    elapsed_ms: AtomicU64,
    success: AtomicBool,
    slow: AtomicBool,
    alerted: AtomicBool,
    failure: OnceLock<DbError>,

    // Non-owning: the caller's statement handle decides its lifetime
    statement: Weak<dyn Cancel>,
}

impl ExecutionRecord {
    pub fn new(identity: RecordIdentity, slow_threshold_ms: u64, statement: Weak<dyn Cancel>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            slow_threshold_ms,
            execute_start_ms: AtomicU64::new(0),
            execute_end_ms: AtomicU64::new(0),
            elapsed_ms: AtomicU64::new(0),
            success: AtomicBool::new(false),
            slow: AtomicBool::new(false),
            alerted: AtomicBool::new(false),
            failure: OnceLock::new(),
            statement,
        }
    }

    /// Record with no statement behind it (cannot be cancelled)
    pub fn detached(identity: RecordIdentity, slow_threshold_ms: u64) -> Self {
        let statement: Weak<dyn Cancel> = Weak::<Detached>::new();
        Self::new(identity, slow_threshold_ms, statement)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn data_source(&self) -> &str {
        &self.identity.data_source
    }

    pub fn connection_id(&self) -> Uuid {
        self.identity.connection_id
    }

    pub fn kind(&self) -> StatementKind {
        self.identity.kind
    }

    pub fn sql(&self) -> &str {
        &self.identity.sql
    }

    pub fn prepare_start_ms(&self) -> u64 {
        self.identity.prepare_start_ms
    }

    pub fn prepare_end_ms(&self) -> u64 {
        self.identity.prepare_end_ms
    }

    pub fn slow_threshold_ms(&self) -> u64 {
        self.slow_threshold_ms
    }

    pub fn execute_start_ms(&self) -> Option<u64> {
        non_zero(self.execute_start_ms.load(Ordering::SeqCst))
    }

    pub fn execute_end_ms(&self) -> Option<u64> {
        non_zero(self.execute_end_ms.load(Ordering::SeqCst))
    }

    /// Set only once the record is terminal
    pub fn elapsed_ms(&self) -> Option<u64> {
        self.execute_end_ms()
            .map(|_| self.elapsed_ms.load(Ordering::SeqCst))
    }

    pub fn is_success(&self) -> bool {
        self.success.load(Ordering::SeqCst)
    }

    pub fn is_slow(&self) -> bool {
        self.slow.load(Ordering::SeqCst)
    }

    pub fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::SeqCst)
    }

    pub fn failure(&self) -> Option<&DbError> {
        self.failure.get()
    }

    pub fn is_running(&self) -> bool {
        self.execute_start_ms().is_some() && self.execute_end_ms().is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.execute_end_ms().is_some()
    }

    /// Live statement handle, if the caller still holds it
    pub fn statement(&self) -> Option<Arc<dyn Cancel>> {
        self.statement.upgrade()
    }

    /// Time spent executing so far (or in total once terminal)
    pub fn running_ms(&self, now_ms: u64) -> u64 {
        match (self.execute_start_ms(), self.elapsed_ms()) {
            (_, Some(elapsed)) => elapsed,
            (Some(start), None) => now_ms.saturating_sub(start),
            (None, None) => 0,
        }
    }

    pub(crate) fn mark_started(&self, now_ms: u64) {
        let _ = self.execute_start_ms.compare_exchange(
            0,
            now_ms.max(1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Write the terminal outcome. Only the first call has any effect.
    ///
    /// Returns `false` if the record was already terminal.
    pub(crate) fn finish(&self, now_ms: u64, success: bool, failure: Option<&DbError>) -> bool {
        if self.execute_end_ms.load(Ordering::SeqCst) != 0 {
            return false;
        }
        let start = self.execute_start_ms.load(Ordering::SeqCst);
        let end = now_ms.max(start).max(1);
        let elapsed = end - start.min(end);
        let slow = elapsed >= self.slow_threshold_ms;

        if let Some(err) = failure {
            let _ = self.failure.set(err.clone());
        }
        self.success.store(success, Ordering::SeqCst);
        self.elapsed_ms.store(elapsed, Ordering::SeqCst);
        self.slow.store(slow, Ordering::SeqCst);

        if self
            .execute_end_ms
            .compare_exchange(0, end, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        // The scanner may have raced a provisional flag in after the first store
        self.slow.store(slow, Ordering::SeqCst);
        true
    }

    /// Mark a running execution slow ahead of completion.
    ///
    /// Returns `true` if the flag changed. If the execution completed in the
    /// meantime the terminal value is restored.
    pub(crate) fn mark_slow_provisional(&self) -> bool {
        let changed = !self.slow.swap(true, Ordering::SeqCst);
        if self.execute_end_ms.load(Ordering::SeqCst) != 0 {
            let terminal = self.elapsed_ms.load(Ordering::SeqCst) >= self.slow_threshold_ms;
            self.slow.store(terminal, Ordering::SeqCst);
            return changed && terminal;
        }
        changed
    }

    /// Running past the slow threshold and not yet flagged
    pub(crate) fn is_overdue(&self, now_ms: u64) -> bool {
        self.is_running() && self.running_ms(now_ms) >= self.slow_threshold_ms
    }

    /// Flagged (failed or slow) and not yet part of any alert batch
    pub fn needs_alert(&self) -> bool {
        if self.is_alerted() {
            return false;
        }
        self.is_slow() || (self.is_terminal() && !self.is_success())
    }

    /// Claim this record for an alert batch. At most one caller ever wins.
    pub(crate) fn try_mark_alerted(&self) -> bool {
        self.alerted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn status(&self) -> ExecutionStatus {
        match (self.execute_start_ms(), self.is_terminal(), self.is_success()) {
            (None, _, _) => ExecutionStatus::Pending,
            (Some(_), false, _) => ExecutionStatus::Running,
            (Some(_), true, true) => ExecutionStatus::Succeeded,
            (Some(_), true, false) => ExecutionStatus::Failed,
        }
    }

    /// Point-in-time, serializable copy for monitoring collaborators
    pub fn snapshot(&self) -> RecordSnapshot {
        let execute_start_ms = self.execute_start_ms();
        RecordSnapshot {
            id: self.id,
            data_source: self.data_source().to_string(),
            connection_id: self.connection_id(),
            kind: self.kind(),
            sql: self.sql().to_string(),
            prepare_start_ms: self.prepare_start_ms(),
            prepare_end_ms: self.prepare_end_ms(),
            prepare_ms: self.prepare_end_ms().saturating_sub(self.prepare_start_ms()),
            execute_start_ms,
            execute_end_ms: self.execute_end_ms(),
            elapsed_ms: self.elapsed_ms(),
            started_at: execute_start_ms.map(format_millis),
            status: self.status(),
            slow: self.is_slow(),
            alerted: self.is_alerted(),
            error: self.failure().map(|e| e.to_string()),
        }
    }
}

impl fmt::Debug for ExecutionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRecord")
            .field("id", &self.id)
            .field("data_source", &self.identity.data_source)
            .field("kind", &self.identity.kind)
            .field("sql", &self.identity.sql)
            .field("status", &self.status())
            .field("elapsed_ms", &self.elapsed_ms())
            .field("slow", &self.is_slow())
            .field("alerted", &self.is_alerted())
            .finish()
    }
}

fn non_zero(v: u64) -> Option<u64> {
    (v != 0).then_some(v)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Serializable view of an [`ExecutionRecord`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSnapshot {
    pub id: Uuid,
    pub data_source: String,
    pub connection_id: Uuid,
    pub kind: StatementKind,
    pub sql: String,
    pub prepare_start_ms: u64,
    pub prepare_end_ms: u64,
    pub prepare_ms: u64,
    pub execute_start_ms: Option<u64>,
    pub execute_end_ms: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub started_at: Option<String>,
    pub status: ExecutionStatus,
    pub slow: bool,
    pub alerted: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(threshold: u64) -> ExecutionRecord {
        ExecutionRecord::detached(
            RecordIdentity::plain("main", Uuid::new_v4(), "SELECT 1"),
            threshold,
        )
    }

    #[test]
    fn test_finish_sets_elapsed_exactly() {
        let r = record(100);
        r.mark_started(1_000);
        assert!(r.is_running());
        assert!(r.finish(1_150, true, None));

        assert_eq!(r.execute_end_ms(), Some(1_150));
        assert_eq!(r.elapsed_ms(), Some(150));
        assert!(r.is_success());
        assert!(r.is_slow());
        assert_eq!(r.status(), ExecutionStatus::Succeeded);
    }

    #[test]
    fn test_finish_only_once() {
        let r = record(100);
        r.mark_started(1_000);
        assert!(r.finish(1_010, false, Some(&DbError::Cancelled)));
        assert!(!r.finish(5_000, true, None));

        assert_eq!(r.elapsed_ms(), Some(10));
        assert!(!r.is_success());
        assert_eq!(r.failure(), Some(&DbError::Cancelled));
    }

    #[test]
    fn test_slow_threshold_is_inclusive() {
        let r = record(100);
        r.mark_started(1_000);
        r.finish(1_100, true, None);
        assert!(r.is_slow());

        let r = record(100);
        r.mark_started(1_000);
        r.finish(1_099, true, None);
        assert!(!r.is_slow());
    }

    #[test]
    fn test_clock_going_backwards_never_underflows() {
        let r = record(100);
        r.mark_started(2_000);
        r.finish(1_500, true, None);
        assert_eq!(r.execute_end_ms(), Some(2_000));
        assert_eq!(r.elapsed_ms(), Some(0));
    }

    #[test]
    fn test_provisional_slow_is_revised_by_completion() {
        let r = record(100);
        r.mark_started(1_000);
        assert!(r.is_overdue(1_200));
        assert!(r.mark_slow_provisional());
        assert!(!r.mark_slow_provisional());

        r.finish(1_050, true, None);
        assert!(!r.is_slow());
    }

    #[test]
    fn test_provisional_slow_after_completion_keeps_terminal_value() {
        let r = record(100);
        r.mark_started(1_000);
        r.finish(1_020, true, None);
        assert!(!r.mark_slow_provisional());
        assert!(!r.is_slow());
    }

    #[test]
    fn test_alerted_is_claimed_once() {
        let r = record(100);
        r.mark_started(1_000);
        r.finish(1_001, false, Some(&DbError::Timeout("1s".to_string())));

        assert!(r.needs_alert());
        assert!(r.try_mark_alerted());
        assert!(!r.try_mark_alerted());
        assert!(!r.needs_alert());
        assert!(r.is_alerted());
    }

    #[test]
    fn test_running_record_is_not_failed() {
        let r = record(100);
        r.mark_started(1_000);
        assert!(!r.needs_alert());
        assert_eq!(r.status(), ExecutionStatus::Running);
        assert_eq!(r.running_ms(1_040), 40);
    }

    #[test]
    fn test_detached_record_has_no_statement() {
        assert!(record(1).statement().is_none());
    }

    #[test]
    fn test_snapshot_reports_error_text() {
        let r = record(100);
        r.mark_started(1_000);
        r.finish(1_005, false, Some(&DbError::Closed));

        let snap = r.snapshot();
        assert_eq!(snap.status, ExecutionStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("Connection closed"));
        assert_eq!(snap.elapsed_ms, Some(5));
        assert!(snap.started_at.is_some());
    }
}
