// Pipeline
// A parsed, validated definition with its task graph, ready to run

use crate::config::{Action, PipelineDef, PipelineParser, PipelineValidator};
use crate::error::ConfigError;
use crate::execution::{ExecutionContext, ExecutorConfig, TaskGraph};
use crate::source::JsonLinesReader;
use crate::storage::StorageConnector;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A pipeline that passed parsing, validation and graph construction
#[derive(Debug)]
pub struct Pipeline {
    pub definition: PipelineDef,
    pub graph: TaskGraph,
    /// Directory that source locators are resolved against
    pub base_dir: PathBuf,
}

impl Pipeline {
    /// Load a pipeline file; locators resolve relative to its directory
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let definition = PipelineParser::parse_file(path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_definition(definition, base_dir)
    }

    pub fn from_definition(
        definition: PipelineDef,
        base_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        PipelineValidator::validate(&definition).map_err(ConfigError::Invalid)?;
        let graph = TaskGraph::build(definition.tasks.clone())?;

        debug!(
            pipeline = %definition.name,
            tasks = graph.len(),
            batches = graph.topological_batches().len(),
            "pipeline loaded"
        );

        Ok(Self {
            definition,
            graph,
            base_dir: base_dir.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Relations written by stage loads, to be emptied before a run
    pub fn landing_relations(&self) -> Vec<String> {
        let mut relations: Vec<String> = Vec::new();
        for task in self.graph.iter() {
            if let Action::StageLoad(load) = &task.action {
                if !relations.contains(&load.target) {
                    relations.push(load.target.clone());
                }
            }
        }
        relations
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::from(&self.definition.settings)
    }

    /// Execution context reading sources from `base_dir`
    pub fn context(&self, storage: Arc<dyn StorageConnector>) -> ExecutionContext {
        ExecutionContext::new(
            self.name(),
            storage,
            Arc::new(JsonLinesReader::new(&self.base_dir)),
        )
    }
}
