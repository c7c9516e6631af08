// Task lifecycle states

use serde::Serialize;

use std::collections::HashMap;
use std::fmt;

/// Task lifecycle: Pending -> Running -> Succeeded | Failed, or Pending -> Skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Skipped)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task '{task}' cannot move from {from} to {to}")]
pub struct TransitionError {
    pub task: String,
    pub from: TaskState,
    pub to: TaskState,
}

/// Current state of every task in a run, owned by the scheduler
#[derive(Debug, Clone, Default)]
pub struct TaskStates {
    states: HashMap<String, TaskState>,
}

impl TaskStates {
    /// All tasks start pending
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            states: ids
                .into_iter()
                .map(|id| (id.to_string(), TaskState::Pending))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<TaskState> {
        self.states.get(id).copied()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.get(id) == Some(TaskState::Pending)
    }

    /// Move a task forward, rejecting transitions the lifecycle forbids
    pub fn advance(&mut self, id: &str, next: TaskState) -> Result<(), TransitionError> {
        let current = self.get(id).unwrap_or(TaskState::Pending);
        if !current.can_transition_to(next) {
            return Err(TransitionError {
                task: id.to_string(),
                from: current,
                to: next,
            });
        }
        self.states.insert(id.to_string(), next);
        Ok(())
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }
}
