// Starflow Service Library
// Core service for staging, star-schema loads and quality-gated ETL runs

pub mod config;
pub mod error;
pub mod execution;
pub mod load;
pub mod pipeline;
pub mod quality;
pub mod record;
pub mod source;
pub mod storage;

// Re-export commonly used types
pub use error::{ConfigError, ErrorKind, TaskError};
pub use pipeline::Pipeline;
pub use record::{Record, Value};

// Re-export config types
pub use config::{
    Action, ParseError, ParseErrorKind, PipelineDef, PipelineParser, PipelineValidator, Settings,
    TaskDef, ValidationError,
};

// Re-export execution types
pub use execution::{
    progress_channel, AttemptOutcome, AttemptRecord, ExecutionContext, ExecutionEvent,
    ExecutorConfig, GraphError, GraphErrorKind, PipelineExecutor, PipelineOutcome, ProgressSender,
    RetryPolicy, RunReport, RunSummary, TaskGraph, TaskState,
};

// Re-export load and quality types
pub use load::{
    ColumnDef, ConflictPolicy, DimensionLoad, FactLoad, FieldFilter, Input, LoadOutcome, LoadSpec,
    Lookup, StageLoad, TaskOutput, TimePart,
};
pub use quality::{CheckResult, Comparison, GateOutcome, QualityCheck, QualityGate};

// Re-export collaborator types
pub use source::{JsonLinesReader, RecordReader, SourceError};
pub use storage::{MemoryStorage, Probe, SqliteStorage, Storage, StorageConnector, StorageError};
