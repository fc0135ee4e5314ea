pub mod alert;
pub mod clock;
pub mod config;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod intercept;
pub mod logging;
pub mod metrics;
pub mod record;
pub mod scanner;
pub mod store;
pub mod tracer;

pub use alert::{AlertSink, LoggingAlertSink, NoopAlertSink, WebhookAlertSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, TracerConfig};
pub use error::{DbError, TraceError};
pub use intercept::{TracedConnection, TracedPreparedStatement, TracedStatement};
pub use record::{ExecutionRecord, ExecutionStatus, RecordSnapshot, StatementKind};
pub use scanner::ScanReport;
pub use store::TraceStore;
pub use tracer::SqlTracer;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Note: This function can only be called once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Same as [`init_tracing`], emitting one JSON object per event
pub fn init_tracing_json() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true))
        .init();
}
