use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::FlowError;
use crate::task::{Action, TaskFn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by a task action.
///
/// Actions decide whether retrying makes sense: a [`TaskError::Transient`]
/// error is retried under the task's retry policy, anything else ends the
/// task immediately.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{0}")]
    Transient(BoxError),
    #[error("{0}")]
    Permanent(BoxError),
    #[error("retry failed after {timeout:?}{}", last_error_suffix(.last_error))]
    Timeout {
        timeout: Duration,
        last_error: Option<Box<TaskError>>,
    },
    #[error("task cancelled")]
    Cancelled,
}

fn last_error_suffix(last_error: &Option<Box<TaskError>>) -> String {
    match last_error {
        Some(err) => format!(", last error: {}", err),
        None => String::new(),
    }
}

impl TaskError {
    pub fn transient(err: impl Into<BoxError>) -> Self {
        TaskError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<BoxError>) -> Self {
        TaskError::Permanent(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, TaskError::Permanent(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

impl From<&str> for TaskError {
    fn from(msg: &str) -> Self {
        TaskError::transient(msg)
    }
}

impl From<String> for TaskError {
    fn from(msg: String) -> Self {
        TaskError::transient(msg)
    }
}

impl From<BoxError> for TaskError {
    fn from(err: BoxError) -> Self {
        TaskError::Transient(err)
    }
}

/// Classifies the error of any `Result` for the retry loop.
pub trait ResultExt<T> {
    fn transient(self) -> Result<T, TaskError>;
    fn permanent(self) -> Result<T, TaskError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn transient(self) -> Result<T, TaskError> {
        self.map_err(TaskError::transient)
    }

    fn permanent(self) -> Result<T, TaskError> {
        self.map_err(TaskError::permanent)
    }
}

/// Several task errors joined into one, as produced by [`crate::Parallel`].
#[derive(Error, Debug)]
#[error("{}", join_errors(.0))]
pub struct TaskErrors(pub Vec<TaskError>);

fn join_errors(errors: &[TaskError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A task error tagged with the name of the task that produced it.
#[derive(Debug)]
pub struct NamedError {
    pub task: String,
    pub error: TaskError,
}

impl fmt::Display for NamedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {:?} failed: {}", self.task, self.error)
    }
}

impl std::error::Error for NamedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Terminal task errors of one run, in the order the tasks finished.
#[derive(Debug, Default)]
pub struct AggregatedError {
    flow_name: String,
    errors: Vec<NamedError>,
}

impl AggregatedError {
    pub fn new(flow_name: impl Into<String>) -> Self {
        Self {
            flow_name: flow_name.into(),
            errors: Vec::new(),
        }
    }

    /// Records the terminal error of `task_name`. A task contributes at most
    /// one error; a second one for the same task replaces the first.
    pub fn add(&mut self, task_name: impl Into<String>, error: TaskError) {
        let task = task_name.into();
        if let Some(pos) = self.errors.iter().position(|e| e.task == task) {
            self.errors.remove(pos);
        }
        self.errors.push(NamedError { task, error });
    }

    pub fn errors(&self) -> &[NamedError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<NamedError> {
        self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.task.as_str()).collect()
    }

    pub fn get(&self, task_name: &str) -> Option<&TaskError> {
        self.errors
            .iter()
            .find(|e| e.task == task_name)
            .map(|e| &e.error)
    }

    /// Removes and returns the error recorded for `task_name`.
    pub fn acknowledge(&mut self, task_name: &str) -> Option<NamedError> {
        let pos = self.errors.iter().position(|e| e.task == task_name)?;
        Some(self.errors.remove(pos))
    }
}

impl fmt::Display for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "flow {:?} encountered no task errors", self.flow_name);
        }
        write!(f, "flow {:?} encountered task errors: [", self.flow_name)?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", err)?;
        }
        f.write_str("]")
    }
}

impl std::error::Error for AggregatedError {}

/// Ids of tasks that failed in earlier attempts of the same flow, typically
/// loaded from persisted status before a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    name: String,
    last_error_ids: BTreeSet<String>,
}

impl ErrorContext {
    pub fn new<I, S>(name: impl Into<String>, last_error_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            last_error_ids: last_error_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_error_with_id(&self, id: &str) -> bool {
        self.last_error_ids.contains(id)
    }

    pub fn add_error_id(&mut self, id: impl Into<String>) {
        self.last_error_ids.insert(id.into());
    }

    pub fn remove_error_id(&mut self, id: &str) -> bool {
        self.last_error_ids.remove(id)
    }

    pub fn error_ids(&self) -> impl Iterator<Item = &str> {
        self.last_error_ids.iter().map(String::as_str)
    }

    /// Runs `steps` one after another, stopping at the first failure.
    ///
    /// A step that succeeds after having failed before is handed to
    /// `on_success` and its id is forgotten; an error from `on_success` stops
    /// the remaining steps. A failing step's id is recorded and handed to
    /// `on_failure`, which may return its own error in place of
    /// [`FlowError::Step`].
    pub async fn handle_errors<S, F>(
        &mut self,
        ctx: &CancellationToken,
        mut on_success: S,
        mut on_failure: F,
        steps: Vec<Step>,
    ) -> Result<(), FlowError>
    where
        S: FnMut(&str) -> Result<(), FlowError>,
        F: FnMut(&str, &TaskError) -> Result<(), FlowError>,
    {
        for step in steps {
            debug!(context = %self.name, step = %step.id, "Executing step");
            match step.action.run(ctx.clone()).await {
                Ok(()) => {
                    if self.remove_error_id(&step.id) {
                        on_success(&step.id)?;
                    }
                }
                Err(source) => {
                    warn!(context = %self.name, step = %step.id, error = %source, "Step failed");
                    self.add_error_id(step.id.clone());
                    on_failure(&step.id, &source)?;
                    return Err(FlowError::Step {
                        id: step.id,
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

/// A named preparatory step for [`ErrorContext::handle_errors`].
#[derive(Clone)]
pub struct Step {
    id: String,
    action: Arc<dyn Action>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("id", &self.id).finish()
    }
}

pub fn to_execute<F, Fut>(id: impl Into<String>, f: F) -> Step
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Step {
        id: id.into(),
        action: Arc::new(TaskFn::new(f)),
    }
}
