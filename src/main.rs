use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use sql_tracer::{init_tracing, init_tracing_json};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    if args.json_logs {
        init_tracing_json();
    } else {
        init_tracing();
    }

    let config_path = args.config.as_deref();

    match args.command {
        cli::Commands::Exec(exec) => {
            commands::exec::execute(config_path, exec).await?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(config_path)?,
            cli::ConfigCommands::Validate => commands::config::validate(config_path)?,
        },
        cli::Commands::Version => {
            println!("sql-tracer v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
