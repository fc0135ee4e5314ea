use anyhow::Result;
use colored::Colorize;
use sql_tracer::config::{self, TracerConfig};
use std::path::Path;
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration (file plus environment overrides)
pub fn show(path: Option<&Path>) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(path)?;
    let sanitized = mask_webhook(&cfg);

    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(&sanitized)?;
    println!("{}", toml_string);

    Ok(())
}

/// Execute the config validate command
pub fn validate(path: Option<&Path>) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());
    info!("Validating configuration file");

    let cfg = config::load_config(path)?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Trace Capacity: {}", cfg.max_trace_size);
    println!("  Slow Threshold: {}ms", cfg.slow_threshold_ms);
    println!("  Retention Window: {}ms", cfg.retention_window_ms);
    println!("  Scan Period: {}ms", cfg.scan_period().as_millis());
    println!(
        "  Alert Webhook: {}",
        if cfg.alert.webhook_url.is_some() { "configured" } else { "none" }
    );

    info!("Configuration validation successful");
    Ok(())
}

/// Webhook URLs often carry tokens in the query string
fn mask_webhook(cfg: &TracerConfig) -> TracerConfig {
    let mut sanitized = cfg.clone();
    if let Some(url) = &mut sanitized.alert.webhook_url {
        *url = mask_query(url);
    }
    sanitized
}

fn mask_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{}?***", base),
        None => url.to_string(),
    }
}
