// Quality Gate
// Runs every check against loaded state and aggregates a pass/fail outcome

use crate::error::TaskError;
use crate::execution::context::ExecutionContext;
use crate::quality::check::{CheckResult, QualityCheck};
use crate::storage::Storage;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// An ordered set of checks evaluated together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGate {
    pub checks: Vec<QualityCheck>,
}

/// Aggregate result of a gate
#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub overall_pass: bool,
    pub results: Vec<CheckResult>,
}

impl GateOutcome {
    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }
}

impl QualityGate {
    pub fn new(checks: Vec<QualityCheck>) -> Self {
        Self { checks }
    }

    /// Evaluate every check; a failing check never stops the others
    pub fn run_checks(&self, storage: &mut dyn Storage) -> GateOutcome {
        let mut results = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let result = check.run(storage);
            if !result.passed {
                warn!(check = %result.check, "{}", result.describe());
            }
            results.push(result);
        }

        GateOutcome {
            overall_pass: results.iter().all(|r| r.passed),
            results,
        }
    }

    /// Run the gate as a task attempt
    ///
    /// A failing gate is a `QualityCheck` error carrying every result.
    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<GateOutcome, TaskError> {
        let gate = self.clone();
        let connector = ctx.storage.clone();

        let outcome = ctx
            .workers
            .spawn_blocking(move || {
                let mut storage = connector.connect()?;
                Ok::<_, TaskError>(gate.run_checks(storage.as_mut()))
            })
            .await
            .map_err(|e| TaskError::permanent(format!("quality worker failed: {}", e)))??;

        info!(
            checks = outcome.results.len(),
            failed = outcome.failed_count(),
            "quality gate evaluated"
        );

        if outcome.overall_pass {
            Ok(outcome)
        } else {
            Err(TaskError::QualityCheck(outcome))
        }
    }
}
