// Run Report
// Append-only attempt log written by the scheduler, summarised for the CLI

use crate::error::{ErrorKind, TaskError};
use crate::execution::state::TaskState;
use crate::load::TaskOutput;

use chrono::{DateTime, Utc};
use serde::Serialize;

use std::fmt;
use std::time::Duration;

/// Outcome of one attempt (or of a task that never ran)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Terminal outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Success,
    Failure,
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Success => write!(f, "SUCCESS"),
            PipelineOutcome::Failure => write!(f, "FAILURE"),
        }
    }
}

/// One entry in the run report
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub task: String,
    /// 1-based attempt number, 0 for skipped tasks
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Failed task that caused this one to be skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
}

impl AttemptRecord {
    pub fn succeeded(
        task: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        output: TaskOutput,
    ) -> Self {
        Self {
            task: task.into(),
            attempt,
            started_at,
            finished_at: Utc::now(),
            outcome: AttemptOutcome::Succeeded,
            error_kind: None,
            detail: None,
            upstream: None,
            output: Some(output),
        }
    }

    pub fn failed(
        task: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        error: &TaskError,
    ) -> Self {
        let output = match error {
            TaskError::QualityCheck(outcome) => Some(TaskOutput::Gate(outcome.clone())),
            _ => None,
        };

        Self {
            task: task.into(),
            attempt,
            started_at,
            finished_at: Utc::now(),
            outcome: AttemptOutcome::Failed,
            error_kind: Some(error.kind()),
            detail: Some(error.detail()),
            upstream: None,
            output,
        }
    }

    pub fn skipped(task: impl Into<String>, upstream: Option<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task: task.into(),
            attempt: 0,
            started_at: now,
            finished_at: now,
            outcome: AttemptOutcome::Skipped,
            error_kind: None,
            detail: Some(reason.into()),
            upstream,
            output: None,
        }
    }
}

/// Ordered log of every attempt in a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<PipelineOutcome>,
    pub cancelled: bool,
    entries: Vec<AttemptRecord>,
}

impl RunReport {
    pub fn new(pipeline: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            cancelled: false,
            entries: Vec::new(),
        }
    }

    pub fn append(&mut self, record: AttemptRecord) {
        self.entries.push(record);
    }

    /// Seal the report with the terminal outcome
    pub fn finish(&mut self, outcome: PipelineOutcome, cancelled: bool) {
        self.outcome = Some(outcome);
        self.cancelled = cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn entries(&self) -> &[AttemptRecord] {
        &self.entries
    }

    /// Terminal outcome; `Failure` while the run is unfinished
    pub fn outcome(&self) -> PipelineOutcome {
        self.outcome.unwrap_or(PipelineOutcome::Failure)
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == PipelineOutcome::Success
    }

    /// Attempts actually started for a task
    pub fn attempts_for(&self, task: &str) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.task == task && e.outcome != AttemptOutcome::Skipped)
            .count() as u32
    }

    /// State implied by the last entry for a task
    pub fn final_state(&self, task: &str) -> TaskState {
        match self.last_entry(task).map(|e| e.outcome) {
            Some(AttemptOutcome::Succeeded) => TaskState::Succeeded,
            Some(AttemptOutcome::Failed) => TaskState::Failed,
            Some(AttemptOutcome::Skipped) => TaskState::Skipped,
            None => TaskState::Pending,
        }
    }

    pub fn last_entry(&self, task: &str) -> Option<&AttemptRecord> {
        self.entries.iter().rev().find(|e| e.task == task)
    }

    pub fn duration(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    /// Per-task view of the run, tasks in first-seen order
    pub fn summarize(&self) -> RunSummary {
        let mut order: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !order.contains(&entry.task.as_str()) {
                order.push(&entry.task);
            }
        }

        let tasks: Vec<TaskSummary> = order
            .into_iter()
            .filter_map(|task| {
                let last = self.last_entry(task)?;
                Some(TaskSummary {
                    task: task.to_string(),
                    state: self.final_state(task),
                    attempts: self.attempts_for(task),
                    error_kind: last.error_kind,
                    detail: last.detail.clone(),
                    upstream: last.upstream.clone(),
                    output: last.output.clone(),
                })
            })
            .collect();

        let count = |state: TaskState| tasks.iter().filter(|t| t.state == state).count();
        let succeeded = count(TaskState::Succeeded);
        let failed = count(TaskState::Failed);
        let skipped = count(TaskState::Skipped);

        let outcome = self.outcome.unwrap_or(if failed == 0 && skipped == 0 {
            PipelineOutcome::Success
        } else {
            PipelineOutcome::Failure
        });

        RunSummary {
            pipeline: self.pipeline.clone(),
            succeeded,
            failed,
            skipped,
            tasks,
            outcome,
            cancelled: self.cancelled,
            duration: self.duration(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Final state of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task: String,
    pub state: TaskState,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
    pub upstream: Option<String>,
    pub output: Option<TaskOutput>,
}

/// Human-oriented digest of a run report
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub pipeline: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub tasks: Vec<TaskSummary>,
    pub outcome: PipelineOutcome,
    pub cancelled: bool,
    pub duration: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "pipeline {}: {} ({} succeeded, {} failed, {} skipped) in {:.2}s",
            self.pipeline,
            self.outcome,
            self.succeeded,
            self.failed,
            self.skipped,
            self.duration.as_secs_f64()
        )?;
        if self.cancelled {
            writeln!(f, "run was cancelled")?;
        }

        let width = self.tasks.iter().map(|t| t.task.len()).max().unwrap_or(0);
        for task in &self.tasks {
            write!(f, "  {:width$}  {:9}", task.task, task.state.to_string(), width = width)?;
            if task.attempts > 1 {
                write!(f, "  {} attempts", task.attempts)?;
            }
            if let Some(output) = &task.output {
                let text = output.describe();
                if !text.is_empty() {
                    write!(f, "  {}", text)?;
                }
            }
            match (&task.state, &task.detail) {
                (TaskState::Failed, Some(detail)) | (TaskState::Skipped, Some(detail)) => {
                    write!(f, "  {}", detail)?
                }
                _ => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::LoadOutcome;

    fn loaded(rows: u64) -> TaskOutput {
        TaskOutput::Load(LoadOutcome {
            relation: "songplays".into(),
            rows_read: rows,
            rows_written: rows,
            ..Default::default()
        })
    }

    #[test]
    fn test_summarize_counts_final_states() {
        let mut report = RunReport::new("sparkify", "run-1");
        let now = Utc::now();

        report.append(AttemptRecord::failed("a", 1, now, &TaskError::transient("busy")));
        report.append(AttemptRecord::succeeded("a", 2, now, loaded(3)));
        report.append(AttemptRecord::failed("b", 1, now, &TaskError::permanent("bad row")));
        report.append(AttemptRecord::skipped("c", Some("b".into()), "upstream task 'b' failed"));
        report.finish(PipelineOutcome::Failure, false);

        let summary = report.summarize();
        assert_eq!((summary.succeeded, summary.failed, summary.skipped), (1, 1, 1));
        assert_eq!(summary.outcome, PipelineOutcome::Failure);
        assert_eq!(summary.tasks[0].attempts, 2);
        assert_eq!(summary.tasks[2].upstream.as_deref(), Some("b"));
        assert_eq!(report.attempts_for("c"), 0);
        assert_eq!(report.final_state("a"), TaskState::Succeeded);
        assert_eq!(report.final_state("missing"), TaskState::Pending);

        let text = summary.to_string();
        assert!(text.starts_with("pipeline sparkify: FAILURE (1 succeeded, 1 failed, 1 skipped)"));
        assert!(text.contains("upstream task 'b' failed"));
    }

    #[test]
    fn test_unfinished_report_is_failure() {
        let report = RunReport::new("p", "run");
        assert_eq!(report.outcome(), PipelineOutcome::Failure);
        assert_eq!(report.summarize().outcome, PipelineOutcome::Success);
    }

    #[test]
    fn test_json_output() {
        let mut report = RunReport::new("p", "run");
        report.append(AttemptRecord::failed(
            "load",
            1,
            Utc::now(),
            &TaskError::Timeout(Duration::from_secs(2)),
        ));
        report.finish(PipelineOutcome::Failure, true);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["cancelled"], true);
        assert_eq!(json["entries"][0]["error_kind"], "transient");
        assert!(json["entries"][0].get("upstream").is_none());
    }
}
