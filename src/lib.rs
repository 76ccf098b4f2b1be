//! dagflow compiles dependency graphs of named tasks into immutable plans and
//! runs them concurrently against a [`CancellationToken`].
//!
//! A task may only depend on tasks that were added to the graph before it, so
//! cycles cannot be expressed through the public API. Ready tasks run in
//! parallel, transient failures are retried until the task's timeout, and a
//! failed task blocks its dependents while independent branches keep going.
//! The run returns a [`RunReport`] with every task's final state and the
//! aggregated task errors.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod config;
pub mod cycle_check;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod plan;
pub mod progress;
pub mod retry;
pub mod state;
pub mod task;

pub use config::{FlowConfig, ProgressMode};
pub use errors::{
    AggregatedError, BoxError, ErrorContext, NamedError, ResultExt, Step, TaskError, TaskErrors,
    to_execute,
};
pub use executor::{ErrorCleaner, RunOptions, RunReport};
pub use graph::Graph;
pub use plan::Plan;
pub use progress::{DelayingProgressReporter, ImmediateProgressReporter, ProgressReporter, Stats};
pub use retry::{Backoff, RetryExecutor, RetryPolicy};
pub use state::TaskState;
pub use task::{Action, Parallel, Sequential, Task, TaskFn, TaskId, TaskIds};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("task {task:?} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: TaskId },
    #[error("task name {0:?} is already used in this graph")]
    DuplicateTaskName(String),
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    TaskFailures(#[from] AggregatedError),
    #[error("flow {0:?} was cancelled before all tasks ran")]
    Cancelled(String),
    #[error("{id}: {source}")]
    Step {
        id: String,
        #[source]
        source: TaskError,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}
