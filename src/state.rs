use serde::Serialize;
use std::fmt;

/// State of one task instance within a single run.
///
/// `Pending` and `Running` are the only non-terminal states. A task that is
/// still `Pending` in a finished report was never reached, which only happens
/// when the run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The task's skip predicate returned true; counts as success downstream.
    Skipped,
    /// An upstream dependency failed, so the task was never scheduled.
    BlockedBySkip,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
            TaskState::BlockedBySkip => "blocked_by_skip",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    /// Whether dependents of a task in this state may run.
    pub fn unblocks_dependents(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Skipped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
