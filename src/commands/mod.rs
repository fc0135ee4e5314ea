//! Command implementations for the CLI
//!
//! - exec: Run SQL through a traced SQLite connection
//! - config: Configuration display and validation

pub mod config;
pub mod exec;
