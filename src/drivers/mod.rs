//! Driver implementations of the [`crate::driver`] traits

pub mod sqlite;

pub use sqlite::SqliteConnection;
