// Error Types
// Configuration errors that stop a run before it starts and per-task execution errors

use crate::config::{ParseError, ValidationError};
use crate::execution::graph::GraphError;
use crate::quality::GateOutcome;
use crate::source::SourceError;
use crate::storage::StorageError;

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fatal configuration error: the pipeline never starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("{} validation error(s): {}", .0.len(), summarize_validation(.0))]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

fn summarize_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Classification of a task failure, used for retry decisions and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// I/O timeout, connection drop, busy database: retried per budget
    Transient,
    /// Malformed data, unknown relation, constraint violation: never retried
    Permanent,
    /// A quality gate assertion was false: never retried
    QualityCheck,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::QualityCheck => write!(f, "quality_check"),
        }
    }
}

/// Error raised by a single task attempt
///
/// Task errors never escape the task boundary: the executor records them
/// in the run report and decides between retry, failure and propagation.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("{} of {} quality checks failed", .0.failed_count(), .0.results.len())]
    QualityCheck(GateOutcome),
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::Timeout(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::QualityCheck(_) => ErrorKind::QualityCheck,
        }
    }

    /// Returns `true` if another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Human-readable detail for the run report
    ///
    /// Quality failures list every failing check with observed and expected values.
    pub fn detail(&self) -> String {
        match self {
            Self::QualityCheck(outcome) => {
                let failures: Vec<String> = outcome.failed().map(|r| r.describe()).collect();
                format!("{}: {}", self, failures.join("; "))
            }
            other => other.to_string(),
        }
    }
}

impl From<StorageError> for TaskError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

impl From<SourceError> for TaskError {
    fn from(err: SourceError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}
