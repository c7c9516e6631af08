// Pipeline Definition Models
// Static task definitions read once at startup

use crate::execution::retry::RetryPolicy;
use crate::load::{DimensionLoad, FactLoad, StageLoad};
use crate::quality::QualityGate;

use serde::{Deserialize, Serialize};

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub settings: Settings,

    pub tasks: Vec<TaskDef>,
}

/// Run-wide execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum tasks running at once within a batch (0 = unbounded)
    pub max_concurrency: usize,

    /// Retry budget for tasks that do not declare their own
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// A named unit of work in the task graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: String,

    pub action: Action,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Overrides the pipeline-wide retry budget
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Wall-clock limit per attempt
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskDef {
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            action,
            depends_on: Vec::new(),
            retry: None,
            timeout_secs: None,
        }
    }

    /// A no-op synchronisation point
    pub fn barrier(id: impl Into<String>) -> Self {
        Self::new(id, Action::Barrier)
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// What a task does when it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Copy raw records into a key-less landing relation
    StageLoad(StageLoad),
    /// Deduplicate and load a dimension relation
    DimensionLoad(DimensionLoad),
    /// Resolve foreign keys and load a fact relation
    FactLoad(FactLoad),
    /// Run data-quality assertions against loaded state
    QualityCheck(QualityGate),
    /// No-op barrier
    Barrier,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::StageLoad(_) => "stage_load",
            Action::DimensionLoad(_) => "dimension_load",
            Action::FactLoad(_) => "fact_load",
            Action::QualityCheck(_) => "quality_check",
            Action::Barrier => "barrier",
        }
    }

    /// Relation written by this action, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            Action::StageLoad(load) => Some(&load.target),
            Action::DimensionLoad(load) => Some(&load.spec.target),
            Action::FactLoad(load) => Some(&load.target),
            Action::QualityCheck(_) | Action::Barrier => None,
        }
    }

    /// Dimension and fact loads must be covered by a quality gate
    pub fn is_star_load(&self) -> bool {
        matches!(self, Action::DimensionLoad(_) | Action::FactLoad(_))
    }
}
