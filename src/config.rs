use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tracer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TracerConfig {
    /// Maximum number of executions kept in memory (default: 100)
    #[serde(default = "default_max_trace_size")]
    pub max_trace_size: usize,

    /// Executions at or above this duration are slow (default: 6000)
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,

    /// How long a finished execution stays in memory (default: 3 minutes)
    #[serde(default = "default_retention_window_ms")]
    pub retention_window_ms: u64,

    /// Scanner period; defaults to the retention window
    #[serde(default)]
    pub scan_period_ms: Option<u64>,

    /// Log every executed statement at info level
    #[serde(default)]
    pub show_executed_sql: bool,

    /// Maximum SQL length written to logs (default: 512)
    #[serde(default = "default_log_sql_max_len")]
    pub log_sql_max_len: usize,

    #[serde(default)]
    pub alert: AlertConfig,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            max_trace_size: default_max_trace_size(),
            slow_threshold_ms: default_slow_threshold_ms(),
            retention_window_ms: default_retention_window_ms(),
            scan_period_ms: None,
            show_executed_sql: false,
            log_sql_max_len: default_log_sql_max_len(),
            alert: AlertConfig::default(),
        }
    }
}

impl TracerConfig {
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_millis(self.retention_window_ms)
    }

    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms.unwrap_or(self.retention_window_ms))
    }
}

/// Alert delivery configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertConfig {
    /// Log each flagged execution at warn level (default: true)
    #[serde(default = "default_log_alerts")]
    pub log_alerts: bool,

    /// POST alert batches to this URL
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Webhook request timeout in milliseconds (default: 5000)
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,

    /// Replace string literals with '?' in logged and posted SQL (default: true)
    #[serde(default = "default_redact_literals")]
    pub redact_literals: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            log_alerts: default_log_alerts(),
            webhook_url: None,
            webhook_timeout_ms: default_webhook_timeout_ms(),
            redact_literals: default_redact_literals(),
        }
    }
}

fn default_max_trace_size() -> usize {
    100
}

fn default_slow_threshold_ms() -> u64 {
    6000
}

fn default_retention_window_ms() -> u64 {
    3 * 60 * 1000
}

fn default_log_sql_max_len() -> usize {
    512
}

fn default_log_alerts() -> bool {
    true
}

fn default_webhook_timeout_ms() -> u64 {
    5000
}

fn default_redact_literals() -> bool {
    true
}

/// Load configuration from an optional TOML file plus `SQL_TRACER__*`
/// environment overrides (e.g. `SQL_TRACER__ALERT__WEBHOOK_URL`).
///
/// Without an explicit path, `sql-tracer.toml` in the working directory is
/// used if present.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<TracerConfig> {
    let file = match path {
        Some(path) => config::File::from(path).required(true),
        None => config::File::with_name("sql-tracer").required(false),
    };

    let config = config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix("SQL_TRACER")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let cfg: TracerConfig = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &TracerConfig) -> anyhow::Result<()> {
    if cfg.max_trace_size == 0 {
        anyhow::bail!("max_trace_size must be >= 1");
    }
    if cfg.slow_threshold_ms == 0 {
        anyhow::bail!("slow_threshold_ms must be >= 1");
    }
    if cfg.retention_window_ms == 0 {
        anyhow::bail!("retention_window_ms must be >= 1");
    }
    if cfg.scan_period_ms == Some(0) {
        anyhow::bail!("scan_period_ms must be >= 1 when set");
    }
    if let Some(url) = &cfg.alert.webhook_url {
        if url.trim().is_empty() {
            anyhow::bail!("alert.webhook_url cannot be empty");
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("alert.webhook_url must be an http(s) URL: {}", url);
        }
    }
    Ok(())
}
