//! Capability traits a database driver implements to be traceable.
//!
//! The traced wrappers in [`crate::intercept`] implement these same traits,
//! so instrumented and plain connections are interchangeable at call sites.
//! Every method takes `&self`: a statement must be cancellable from another
//! task while one of its executions is in flight.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::DbError;

/// A single column value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Fully materialized query result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Out-of-band cancellation of an in-flight execution.
///
/// Must be idempotent and must not fail when nothing is running.
pub trait Cancel: Send + Sync + 'static {
    fn cancel(&self) -> Result<(), DbError>;
}

/// Statement that receives its SQL text on each execute call
#[async_trait]
pub trait Statement: Cancel {
    /// Returns `true` when the statement produced a result set
    async fn execute(&self, sql: &str) -> Result<bool, DbError>;

    async fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError>;

    /// Returns the number of affected rows
    async fn execute_update(&self, sql: &str) -> Result<u64, DbError>;

    fn set_query_timeout(&self, timeout: Option<Duration>);

    async fn close(&self) -> Result<(), DbError>;
}

/// Statement bound to fixed SQL text at prepare time
#[async_trait]
pub trait PreparedStatement: Cancel {
    /// Bind a parameter (1-based index)
    fn bind(&self, index: usize, value: Value) -> Result<(), DbError>;

    fn clear_parameters(&self);

    /// Queue the current parameters for `execute_batch`
    fn add_batch(&self) -> Result<(), DbError>;

    async fn execute(&self) -> Result<bool, DbError>;

    async fn execute_query(&self) -> Result<ResultSet, DbError>;

    async fn execute_update(&self) -> Result<u64, DbError>;

    /// Runs every queued parameter set, returning affected rows per set
    async fn execute_batch(&self) -> Result<Vec<u64>, DbError>;

    fn set_query_timeout(&self, timeout: Option<Duration>);

    async fn close(&self) -> Result<(), DbError>;
}

/// A database connection
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Statement: Statement;
    type PreparedStatement: PreparedStatement;

    async fn create_statement(&self) -> Result<Self::Statement, DbError>;

    async fn prepare_statement(&self, sql: &str) -> Result<Self::PreparedStatement, DbError>;

    /// Prepare a stored-procedure call
    async fn prepare_call(&self, sql: &str) -> Result<Self::PreparedStatement, DbError>;

    async fn is_valid(&self) -> bool;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), DbError>;
}
