//! Store layer for the upsert race
//!
//! This module provides the handle surface the upsert core consumes:
//! 1. A `StoreHandle` trait with execute / commit / rollback / close
//! 2. A SQLite implementation with one connection per handle
//! 3. Schema setup and teardown for the `event` table
//! 4. Fault injection for exercising partial failures

mod connection;
mod faulty;
mod schema;

pub use connection::{HandleOpener, SqliteHandle, SqliteStore, StoreConfig};
pub use faulty::{Fault, FaultyHandle};
pub use schema::{create_event_table, drop_event_table};

use std::fmt;

use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Isolation level {0} is not supported by this store")]
    UnsupportedIsolation(IsolationLevel),

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("Injected failure: {0}")]
    Injected(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        StoreError::Database(error.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        StoreError::Io(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Transaction isolation requested for a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "read_uncommitted"),
            IsolationLevel::ReadCommitted => write!(f, "read_committed"),
            IsolationLevel::RepeatableRead => write!(f, "repeatable_read"),
            IsolationLevel::Serializable => write!(f, "serializable"),
        }
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(StoreError::InvalidConfig(format!(
                "unknown isolation level '{}'",
                other
            ))),
        }
    }
}

/// A single connection with manual commit, owned by exactly one writer.
///
/// A transaction is open from the first `execute` until `commit` or
/// `rollback`. Nothing is committed implicitly.
pub trait StoreHandle: Send {
    /// Check that `sql` compiles against this connection.
    fn prepare(&mut self, sql: &str) -> StoreResult<()>;

    /// Run one statement inside the current transaction and return the
    /// number of rows it changed.
    fn execute(&mut self, sql: &str, params: &[&dyn ToSql]) -> StoreResult<usize>;

    fn commit(&mut self) -> StoreResult<()>;

    fn rollback(&mut self) -> StoreResult<()>;

    /// Release the connection. Any open transaction is discarded by the store.
    fn close(self: Box<Self>) -> StoreResult<()>;

    fn isolation(&self) -> IsolationLevel;
}
