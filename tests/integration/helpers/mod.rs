#![allow(dead_code)]

use async_trait::async_trait;
use sql_tracer::{AlertSink, ExecutionRecord, ManualClock, SqlTracer, TraceError, TracerConfig};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Clock start for every test tracer
pub const T0: u64 = 1_000_000;

pub fn test_config(capacity: usize, slow_threshold_ms: u64, retention_window_ms: u64) -> TracerConfig {
    TracerConfig {
        max_trace_size: capacity,
        slow_threshold_ms,
        retention_window_ms,
        scan_period_ms: Some(100),
        ..TracerConfig::default()
    }
}

/// Alert sink that keeps every batch it receives
#[derive(Default)]
pub struct CollectingSink {
    batches: Mutex<Vec<Vec<Uuid>>>,
}

impl CollectingSink {
    pub fn batches(&self) -> Vec<Vec<Uuid>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn alerted_ids(&self) -> Vec<Uuid> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn send(&self, batch: &[Arc<ExecutionRecord>]) -> Result<(), TraceError> {
        self.batches
            .lock()
            .unwrap()
            .push(batch.iter().map(|r| r.id()).collect());
        Ok(())
    }
}

pub fn build_tracer(config: TracerConfig) -> (SqlTracer, Arc<ManualClock>, Arc<CollectingSink>) {
    let clock = Arc::new(ManualClock::new(T0));
    let sink = Arc::new(CollectingSink::default());
    let tracer = SqlTracer::with_clock(config, sink.clone(), clock.clone());
    (tracer, clock, sink)
}

/// Wait until the newest record is running and return it
pub async fn wait_for_running(tracer: &SqlTracer) -> Arc<ExecutionRecord> {
    for _ in 0..200 {
        if let Some(record) = tracer.records().into_iter().find(|r| r.is_running()) {
            return record;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("no running execution appeared");
}
