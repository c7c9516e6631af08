// Execution Engine Module
// Task graph ordering, batch scheduling with retries, and run reporting

pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod report;
pub mod retry;
pub mod state;

// Re-export key types
pub use context::ExecutionContext;
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::{ActionRunner, ExecutorConfig, PipelineExecutor, TaskRunner};
pub use graph::{GraphError, GraphErrorKind, TaskGraph};
pub use report::{AttemptOutcome, AttemptRecord, PipelineOutcome, RunReport, RunSummary, TaskSummary};
pub use retry::RetryPolicy;
pub use state::{TaskState, TaskStates, TransitionError};
