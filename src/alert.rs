//! Alert sinks receive batches of flagged (slow or failed) executions.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AlertConfig;
use crate::error::TraceError;
use crate::logging::sanitize_sql;
use crate::record::{ExecutionRecord, RecordSnapshot};

/// Receives each scanner pass's batch of newly flagged executions.
///
/// A record is delivered at most once. Errors and panics are logged by the
/// scanner and otherwise ignored; the batch is not retried.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn send(&self, batch: &[Arc<ExecutionRecord>]) -> Result<(), TraceError>;
}

/// Discards every batch
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAlertSink;

#[async_trait]
impl AlertSink for NoopAlertSink {
    async fn send(&self, _batch: &[Arc<ExecutionRecord>]) -> Result<(), TraceError> {
        Ok(())
    }
}

/// Writes one `warn` event per flagged execution
#[derive(Debug, Clone)]
pub struct LoggingAlertSink {
    sql_max_len: usize,
    redact_literals: bool,
}

impl LoggingAlertSink {
    pub fn new(sql_max_len: usize, redact_literals: bool) -> Self {
        Self {
            sql_max_len,
            redact_literals,
        }
    }
}

impl Default for LoggingAlertSink {
    fn default() -> Self {
        Self::new(512, true)
    }
}

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn send(&self, batch: &[Arc<ExecutionRecord>]) -> Result<(), TraceError> {
        for record in batch {
            tracing::warn!(
                record_id = %record.id(),
                data_source = %record.data_source(),
                kind = %record.kind(),
                status = %record.status(),
                elapsed_ms = ?record.elapsed_ms(),
                slow = record.is_slow(),
                error = ?record.failure().map(|e| e.to_string()),
                sql = %sanitize_sql(record.sql(), self.sql_max_len, self.redact_literals),
                "Flagged SQL execution"
            );
        }
        Ok(())
    }
}

/// POSTs the batch as a JSON array of [`RecordSnapshot`]s
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
    redact_literals: bool,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TraceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            redact_literals: false,
        })
    }

    pub fn with_redacted_literals(mut self, redact: bool) -> Self {
        self.redact_literals = redact;
        self
    }

    fn payload(&self, batch: &[Arc<ExecutionRecord>]) -> Vec<RecordSnapshot> {
        batch
            .iter()
            .map(|record| {
                let mut snapshot = record.snapshot();
                if self.redact_literals {
                    snapshot.sql = crate::logging::redact_sql_literals(&snapshot.sql).into_owned();
                }
                snapshot
            })
            .collect()
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, batch: &[Arc<ExecutionRecord>]) -> Result<(), TraceError> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(batch))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TraceError::AlertSink(format!(
                "webhook {} responded with {}",
                self.url, status
            )));
        }
        tracing::debug!(url = %self.url, batch_size = batch.len(), "Alert batch delivered");
        Ok(())
    }
}

/// Delivers to every inner sink; reports the first failure after all ran
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AlertSink for FanoutAlertSink {
    async fn send(&self, batch: &[Arc<ExecutionRecord>]) -> Result<(), TraceError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.send(batch).await {
                tracing::warn!(error = %e, "Alert sink in fanout failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Build the sink described by configuration
pub fn sink_from_config(config: &AlertConfig, sql_max_len: usize) -> Result<Arc<dyn AlertSink>, TraceError> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();

    if config.log_alerts {
        sinks.push(Arc::new(LoggingAlertSink::new(
            sql_max_len,
            config.redact_literals,
        )));
    }
    if let Some(url) = &config.webhook_url {
        let webhook = WebhookAlertSink::new(url.clone(), Duration::from_millis(config.webhook_timeout_ms))?
            .with_redacted_literals(config.redact_literals);
        sinks.push(Arc::new(webhook));
    }

    Ok(match sinks.len() {
        0 => Arc::new(NoopAlertSink),
        1 => sinks.remove(0),
        _ => Arc::new(FanoutAlertSink::new(sinks)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::record::RecordIdentity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingSink {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AlertSink for CountingSink {
        async fn send(&self, _batch: &[Arc<ExecutionRecord>]) -> Result<(), TraceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TraceError::AlertSink("boom".to_string()));
            }
            Ok(())
        }
    }

    fn failed_record() -> Arc<ExecutionRecord> {
        let record = ExecutionRecord::detached(
            RecordIdentity::plain("main", Uuid::new_v4(), "UPDATE t SET a = 'secret'"),
            100,
        );
        record.mark_started(1_000);
        record.finish(1_010, false, Some(&DbError::Closed));
        Arc::new(record)
    }

    #[tokio::test]
    async fn test_fanout_runs_all_sinks_and_reports_failure() {
        let failing = Arc::new(CountingSink {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let healthy = Arc::new(CountingSink {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let fanout = FanoutAlertSink::new(vec![failing.clone(), healthy.clone()]);

        let result = fanout.send(&[failed_record()]).await;
        assert!(result.is_err());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logging_sink_never_fails() {
        let sink = LoggingAlertSink::default();
        assert!(sink.send(&[failed_record()]).await.is_ok());
    }

    #[test]
    fn test_webhook_payload_redacts_literals() {
        let sink = WebhookAlertSink::new("http://localhost:1/alerts", Duration::from_secs(1))
            .unwrap()
            .with_redacted_literals(true);
        let payload = sink.payload(&[failed_record()]);
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].sql, "UPDATE t SET a = '?'");
        assert_eq!(payload[0].error.as_deref(), Some("Connection closed"));
    }

    #[test]
    fn test_sink_from_config_without_outputs_is_noop() {
        let config = AlertConfig {
            log_alerts: false,
            webhook_url: None,
            ..AlertConfig::default()
        };
        assert!(sink_from_config(&config, 128).is_ok());
    }
}
