// Source Module
// Record readers for landing files

pub mod json;

pub use json::JsonLinesReader;

use crate::record::Record;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("unsupported locator '{0}': only local files, directories and globs are read")]
    Unsupported(String),

    #[error("invalid glob pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record in {} line {line}: {message}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

impl SourceError {
    /// Interrupted or timed-out reads may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Lazily produced records; I/O and parse errors surface per item
pub type RecordIter = Box<dyn Iterator<Item = Result<Record, SourceError>> + Send>;

/// Opens a source locator for reading
///
/// A locator can be opened any number of times, once per attempt.
pub trait RecordReader: Send + Sync {
    fn open(&self, locator: &str) -> Result<RecordIter, SourceError>;
}
