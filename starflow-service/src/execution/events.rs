// Execution Events
// Progress reporting and event types for pipeline runs

use crate::execution::report::PipelineOutcome;
use crate::execution::state::TaskState;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started
    PipelineStarted {
        pipeline_name: String,
        total_tasks: usize,
        total_batches: usize,
    },

    /// A batch of independent tasks is being launched
    BatchStarted { index: usize, tasks: Vec<String> },

    /// A task attempt started
    TaskStarted { task: String, attempt: u32 },

    /// An attempt failed; `retry_in` is set when another attempt follows
    AttemptFailed {
        task: String,
        attempt: u32,
        error: String,
        retry_in: Option<Duration>,
    },

    /// A task settled as succeeded or failed
    TaskCompleted {
        task: String,
        state: TaskState,
        attempts: u32,
        duration: Duration,
    },

    /// A task never ran (upstream failure or cancellation)
    TaskSkipped { task: String, reason: String },

    /// Run reached its terminal outcome
    PipelineCompleted {
        pipeline_name: String,
        outcome: PipelineOutcome,
        duration: Duration,
    },
}

impl ExecutionEvent {
    pub fn pipeline_started(
        name: impl Into<String>,
        total_tasks: usize,
        total_batches: usize,
    ) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            total_tasks,
            total_batches,
        }
    }

    pub fn pipeline_completed(
        name: impl Into<String>,
        outcome: PipelineOutcome,
        duration: Duration,
    ) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            outcome,
            duration,
        }
    }

    pub fn task_started(task: impl Into<String>, attempt: u32) -> Self {
        Self::TaskStarted {
            task: task.into(),
            attempt,
        }
    }

    pub fn task_skipped(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TaskSkipped {
            task: task.into(),
            reason: reason.into(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
