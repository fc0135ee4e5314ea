use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::record::StatementKind;

/// Install the Prometheus recorder and describe all metrics
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    init_metric_descriptions();
    Ok(handle)
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "sql_tracer_executions_total",
        "Total number of traced SQL executions"
    );
    describe_histogram!(
        "sql_tracer_execution_duration_seconds",
        "Traced SQL execution duration in seconds"
    );
    describe_counter!(
        "sql_tracer_slow_total",
        "Executions flagged slow while still running"
    );
    describe_counter!(
        "sql_tracer_alerts_total",
        "Executions delivered to the alert sink"
    );
    describe_counter!(
        "sql_tracer_alert_failures_total",
        "Alert batches the sink failed to deliver"
    );
    describe_counter!(
        "sql_tracer_evictions_total",
        "Records removed from the trace store"
    );
    describe_counter!(
        "sql_tracer_cancellations_total",
        "Cancellation requests issued to running statements"
    );
    describe_gauge!(
        "sql_tracer_store_size",
        "Approximate number of records in the trace store"
    );
    describe_histogram!(
        "sql_tracer_scan_duration_seconds",
        "Time spent in one scanner pass"
    );

    gauge!("sql_tracer_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Record a finished execution
pub fn record_execution(data_source: &str, kind: StatementKind, success: bool, elapsed: Duration) {
    counter!(
        "sql_tracer_executions_total",
        "data_source" => data_source.to_string(),
        "kind" => kind.as_str(),
        "status" => if success { "success" } else { "failure" },
    )
    .increment(1);

    histogram!(
        "sql_tracer_execution_duration_seconds",
        "data_source" => data_source.to_string(),
        "kind" => kind.as_str(),
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_provisional_slow(count: u64) {
    counter!("sql_tracer_slow_total").increment(count);
}

pub fn record_alerts(count: u64) {
    counter!("sql_tracer_alerts_total").increment(count);
}

pub fn record_alert_failure() {
    counter!("sql_tracer_alert_failures_total").increment(1);
}

/// Record evictions; `reason` is `capacity` or `retention`
pub fn record_evictions(reason: &'static str, count: u64) {
    if count == 0 {
        return;
    }
    counter!("sql_tracer_evictions_total", "reason" => reason).increment(count);
}

pub fn record_cancellation() {
    counter!("sql_tracer_cancellations_total").increment(1);
}

pub fn update_store_size(size: usize) {
    gauge!("sql_tracer_store_size").set(size as f64);
}

pub fn record_scan_duration(duration: Duration) {
    histogram!("sql_tracer_scan_duration_seconds").record(duration.as_secs_f64());
}
