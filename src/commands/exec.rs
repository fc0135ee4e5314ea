//! Exec command
//!
//! Runs statements through a traced SQLite connection, then prints the
//! resulting trace.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use sql_tracer::driver::{Connection, Statement};
use sql_tracer::drivers::sqlite::{returns_rows, SqliteConnection};
use sql_tracer::logging::truncate_sql;
use sql_tracer::record::{ExecutionStatus, RecordSnapshot};
use sql_tracer::{config, SqlTracer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run SQL through a traced connection
#[derive(Debug, Clone, Parser)]
pub struct ExecArgs {
    /// Database URL
    #[arg(short, long, default_value = "sqlite::memory:")]
    pub database: String,

    /// Read statements from a file (separated by ';')
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Per-statement timeout in milliseconds
    #[arg(short, long)]
    pub timeout_ms: Option<u64>,

    /// Print the trace as JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Print Prometheus metrics after the trace
    #[arg(long)]
    pub metrics: bool,

    /// SQL statements to run, in order
    pub sql: Vec<String>,
}

/// Execute the exec command
pub async fn execute(config_path: Option<&Path>, args: ExecArgs) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let prometheus = if args.metrics {
        Some(sql_tracer::metrics::init_metrics()?)
    } else {
        None
    };

    let statements = collect_statements(&args)?;
    if statements.is_empty() {
        eprintln!("{}", "No SQL statements given".yellow());
        return Ok(());
    }

    let tracer = SqlTracer::from_config(cfg)?;
    let conn = SqliteConnection::connect(&args.database)
        .await
        .with_context(|| format!("Failed to open {}", args.database))?;
    let conn = tracer.wrap_connection(conn, &args.database);

    let stmt = conn.create_statement().await?;
    stmt.set_query_timeout(args.timeout_ms.map(Duration::from_millis));

    let mut failures = 0;
    for sql in &statements {
        let outcome = if returns_rows(sql) {
            stmt.execute_query(sql)
                .await
                .map(|rs| format!("{} row(s)", rs.len()))
        } else {
            stmt.execute_update(sql)
                .await
                .map(|n| format!("{} row(s) affected", n))
        };

        match outcome {
            Ok(summary) => println!("{} {} {}", "✓".green(), truncate_sql(sql, 60), summary.dimmed()),
            Err(e) => {
                failures += 1;
                println!("{} {} {}", "✗".red(), truncate_sql(sql, 60), e.to_string().red());
            }
        }
    }

    let report = tracer.scan_now().await;
    let trace = tracer.trace_snapshot();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&trace)?);
    } else {
        println!();
        display_trace_table(&trace);
        println!(
            "{} {} scanned, {} alerted, {} failed",
            "Scan:".bold(),
            report.scanned,
            report.alerted,
            failures
        );
    }

    if let Some(handle) = prometheus {
        println!();
        println!("{}", handle.render());
    }

    conn.close().await?;
    Ok(())
}

fn collect_statements(args: &ExecArgs) -> Result<Vec<String>> {
    let mut statements = Vec::new();

    if let Some(path) = &args.file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        statements.extend(split_statements(&content));
    }
    statements.extend(
        args.sql
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    );

    Ok(statements)
}

/// Split a script on `;`, ignoring semicolons inside string literals
fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_literal = false;

    for c in script.chars() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                current.push(c);
            }
            ';' if !in_literal => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

fn display_trace_table(trace: &[RecordSnapshot]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("STARTED").fg(Color::Cyan),
        Cell::new("KIND").fg(Color::Cyan),
        Cell::new("STATUS").fg(Color::Cyan),
        Cell::new("ELAPSED").fg(Color::Cyan),
        Cell::new("SLOW").fg(Color::Cyan),
        Cell::new("SQL").fg(Color::Cyan),
        Cell::new("ERROR").fg(Color::Cyan),
    ]);

    for record in trace {
        let status_color = match record.status {
            ExecutionStatus::Succeeded => Color::Green,
            ExecutionStatus::Failed => Color::Red,
            _ => Color::Yellow,
        };
        table.add_row(vec![
            Cell::new(record.started_at.as_deref().unwrap_or("-")),
            Cell::new(record.kind.as_str()),
            Cell::new(record.status.to_string()).fg(status_color),
            Cell::new(
                record
                    .elapsed_ms
                    .map(|ms| format!("{}ms", ms))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(if record.slow { "yes" } else { "" }).fg(Color::Yellow),
            Cell::new(truncate_sql(&record.sql, 80)),
            Cell::new(record.error.as_deref().unwrap_or("")),
        ]);
    }

    println!("{}", table);
}
