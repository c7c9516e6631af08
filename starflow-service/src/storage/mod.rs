// Storage Module
// Relational storage sessions used by load strategies and quality probes

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::record::{Record, Value};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by a storage back end
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("cannot connect to storage: {0}")]
    Connection(String),

    #[error("storage is busy: {0}")]
    Busy(String),

    #[error("unknown relation '{0}'")]
    UnknownRelation(String),

    #[error("unknown column '{column}' in relation '{relation}'")]
    UnknownColumn { relation: String, column: String },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("storage error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Dropped connections and lock contention may clear up on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Connection(_) | StorageError::Busy(_))
    }
}

/// Conflict handling for inserts into keyed relations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict<'a> {
    /// Plain insert; a duplicate key in a keyed relation is a constraint violation
    Append,
    /// Keep the existing row
    DoNothing(&'a [String]),
    /// Overwrite the existing row's columns
    Update(&'a [String]),
}

/// A write against a storage session
#[derive(Debug, Clone, Copy)]
pub enum Statement<'a> {
    /// Create the relation if missing and add any missing columns
    CreateRelation {
        relation: &'a str,
        columns: &'a [String],
        key: Option<&'a [String]>,
    },
    /// Remove every row, keeping the relation
    Truncate { relation: &'a str },
    Insert {
        relation: &'a str,
        record: &'a Record,
        on_conflict: OnConflict<'a>,
    },
}

/// A read-only measurement used by quality checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Probe {
    RowCount {
        relation: String,
    },
    NullCount {
        relation: String,
        column: String,
    },
    /// Rows beyond the first for each distinct value of `columns`
    DuplicateCount {
        relation: String,
        columns: Vec<String>,
    },
    /// Arbitrary scalar query, first column of the first row
    Sql {
        query: String,
    },
}

impl Probe {
    pub fn describe(&self) -> String {
        match self {
            Probe::RowCount { relation } => format!("row_count({})", relation),
            Probe::NullCount { relation, column } => format!("null_count({}.{})", relation, column),
            Probe::DuplicateCount { relation, columns } => {
                format!("duplicate_count({}[{}])", relation, columns.join(", "))
            }
            Probe::Sql { query } => format!("sql({})", query.trim()),
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// An open storage session
///
/// Sessions are acquired per task attempt and dropped afterwards; an open
/// transaction is rolled back when the session is dropped.
pub trait Storage: Send {
    /// Execute a write, returning the number of affected rows
    fn execute(&mut self, statement: &Statement<'_>) -> Result<u64, StorageError>;

    /// Read every row of a relation
    fn scan(&mut self, relation: &str) -> Result<Vec<Record>, StorageError>;

    fn probe(&mut self, probe: &Probe) -> Result<Value, StorageError>;

    fn begin(&mut self) -> Result<(), StorageError>;

    fn commit(&mut self) -> Result<(), StorageError>;

    fn rollback(&mut self) -> Result<(), StorageError>;
}

/// Factory for storage sessions, shared across concurrent tasks
pub trait StorageConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Storage>, StorageError>;

    /// Short description for logs
    fn describe(&self) -> String;
}
