use thiserror::Error;

/// Errors surfaced by database drivers.
///
/// This is the error callers observe from a traced call. The tracing layer
/// stores a clone of it on the execution record and returns it to the caller
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// Statement rejected or failed inside the database
    #[error("SQL error{}: {message}", sql_state_suffix(.state))]
    Sql {
        state: Option<String>,
        message: String,
    },
    /// Query timeout exceeded
    #[error("Query timed out: {0}")]
    Timeout(String),
    /// Execution was cancelled through `Cancel::cancel`
    #[error("Statement cancelled")]
    Cancelled,
    /// Connection or statement already closed
    #[error("Connection closed")]
    Closed,
    /// Operation not supported by this driver
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// Any other driver-level failure
    #[error("Driver error: {0}")]
    Driver(String),
}

fn sql_state_suffix(state: &Option<String>) -> String {
    state
        .as_ref()
        .map(|s| format!(" [{}]", s))
        .unwrap_or_default()
}

impl DbError {
    /// Short, stable name for metrics labels and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sql { .. } => "sql",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
            Self::Unsupported(_) => "unsupported",
            Self::Driver(_) => "driver",
        }
    }
}

/// Errors raised by the tracer itself (never by a traced call).
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Alert sink error: {0}")]
    AlertSink(String),
    #[error("Scanner already started")]
    AlreadyStarted,
    #[error("No tokio runtime available to run the scanner")]
    NoRuntime,
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => Self::Sql {
                state: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
            },
            sqlx::Error::PoolClosed => Self::Closed,
            sqlx::Error::PoolTimedOut => Self::Timeout("connection pool timed out".to_string()),
            other => Self::Driver(other.to_string()),
        }
    }
}
