// Execution Context
// Collaborators shared by every task attempt in a run

use crate::source::RecordReader;
use crate::storage::StorageConnector;

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Shared, read-only state handed to each task attempt
#[derive(Clone)]
pub struct ExecutionContext {
    pub pipeline_name: String,

    /// Identifier of this run, derived from its start time
    pub run_id: String,

    /// Opens a fresh storage session per attempt
    pub storage: Arc<dyn StorageConnector>,

    /// Opens source locators for stage and file-based loads
    pub reader: Arc<dyn RecordReader>,

    /// Cancelled when the run should stop launching work
    pub cancellation: CancellationToken,

    /// Blocking storage workers spawned by the current attempt
    pub workers: TaskTracker,
}

impl ExecutionContext {
    pub fn new(
        pipeline_name: impl Into<String>,
        storage: Arc<dyn StorageConnector>,
        reader: Arc<dyn RecordReader>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            run_id: Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string(),
            storage,
            reader,
            cancellation: CancellationToken::new(),
            workers: TaskTracker::new(),
        }
    }

    /// Same collaborators with a fresh worker tracker for one attempt
    pub fn for_attempt(&self) -> Self {
        Self {
            workers: TaskTracker::new(),
            ..self.clone()
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("pipeline_name", &self.pipeline_name)
            .field("run_id", &self.run_id)
            .field("storage", &self.storage.describe())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
