use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::{RetryPolicy, TaskError, TaskErrors};

/// The work a task performs. Long-running actions should watch `ctx` and
/// return once it is cancelled.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError>;
}

/// An [`Action`] backed by a closure.
#[derive(Clone)]
pub struct TaskFn<F>(F);

impl<F, Fut> TaskFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        TaskFn(f)
    }
}

#[async_trait]
impl<F, Fut> Action for TaskFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
        (self.0)(ctx).await
    }
}

pub type SkipFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Handle for a task inside the graph that created it. Only usable as a
/// dependency reference; handles of another graph are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    pub(crate) graph: usize,
    pub(crate) index: usize,
}

impl TaskId {
    pub(crate) fn new(graph: usize, index: usize) -> Self {
        Self { graph, index }
    }

    pub(crate) fn index(self) -> usize {
        self.index
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Set of dependency references. Empty means the task is ready immediately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIds(BTreeSet<TaskId>);

impl TaskIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TaskId) -> &mut Self {
        self.0.insert(id);
        self
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.0.iter().copied()
    }
}

impl<const N: usize> From<[TaskId; N]> for TaskIds {
    fn from(ids: [TaskId; N]) -> Self {
        ids.into_iter().collect()
    }
}

impl FromIterator<TaskId> for TaskIds {
    fn from_iter<I: IntoIterator<Item = TaskId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A named unit of work with its dependencies and execution policy.
#[derive(Clone)]
pub struct Task {
    pub(crate) name: String,
    pub(crate) action: Arc<dyn Action>,
    pub(crate) dependencies: TaskIds,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) skip_if: Option<SkipFn>,
    pub(crate) wait: bool,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self::with_action(name, TaskFn::new(f))
    }

    pub fn with_action(name: impl Into<String>, action: impl Action + 'static) -> Self {
        Self::from_shared(name, Arc::new(action))
    }

    pub fn from_shared(name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self {
            name: name.into(),
            action,
            dependencies: TaskIds::new(),
            retry_policy: None,
            skip_if: None,
            wait: false,
        }
    }

    pub fn depends_on(mut self, dependencies: impl Into<TaskIds>) -> Self {
        self.dependencies = dependencies.into();
        self
    }

    /// Retries transient errors every `interval` until `timeout` has elapsed.
    pub fn retry_until_timeout(self, interval: Duration, timeout: Duration) -> Self {
        self.with_retry_policy(RetryPolicy::until_timeout(interval, timeout))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Evaluated when the task becomes ready; `true` skips the action.
    pub fn skip_if(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.skip_if = Some(Arc::new(predicate));
        self
    }

    /// Marks the task as a "waiting until ..." step.
    pub fn waiting(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &TaskIds {
        &self.dependencies
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn is_skippable(&self) -> bool {
        self.skip_if.is_some()
    }

    pub fn is_wait(&self) -> bool {
        self.wait
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("retry_policy", &self.retry_policy)
            .field("skippable", &self.skip_if.is_some())
            .field("wait", &self.wait)
            .finish()
    }
}

/// Runs all actions concurrently and joins their errors.
#[derive(Clone, Default)]
pub struct Parallel {
    actions: Vec<Arc<dyn Action>>,
}

impl Parallel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, action: impl Action + 'static) -> Self {
        self.actions.push(Arc::new(action));
        self
    }
}

#[async_trait]
impl Action for Parallel {
    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
        let results = join_all(self.actions.iter().map(|a| a.run(ctx.clone()))).await;
        let mut errors: Vec<TaskError> = results.into_iter().filter_map(Result::err).collect();

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ if errors.iter().any(TaskError::is_cancelled) => Err(TaskError::Cancelled),
            // retryable only if every child error is
            _ if errors.iter().all(TaskError::is_retryable) => {
                Err(TaskError::transient(TaskErrors(errors)))
            }
            _ => Err(TaskError::permanent(TaskErrors(errors))),
        }
    }
}

/// Runs actions one after another and stops at the first error.
#[derive(Clone, Default)]
pub struct Sequential {
    actions: Vec<Arc<dyn Action>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, action: impl Action + 'static) -> Self {
        self.actions.push(Arc::new(action));
        self
    }
}

#[async_trait]
impl Action for Sequential {
    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
        for action in &self.actions {
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            action.run(ctx.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> impl Action + 'static {
        let log = log.clone();
        TaskFn::new(move |_ctx| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(label);
                Ok(())
            }
        })
    }

    #[test]
    fn task_ids_from_array_deduplicates() {
        let ids = TaskIds::from([TaskId::new(1, 2), TaskId::new(1, 0), TaskId::new(1, 2)]);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![TaskId::new(1, 0), TaskId::new(1, 2)]);
        assert!(TaskIds::new().is_empty());
    }

    #[test]
    fn builder_records_metadata() {
        let task = Task::new("Waiting until namespace is gone", |_ctx| async { Ok(()) })
            .depends_on([TaskId::new(1, 0)])
            .retry_until_timeout(Duration::from_secs(5), Duration::from_secs(30))
            .skip_if(|| false)
            .waiting();

        assert!(task.is_wait());
        assert!(task.is_skippable());
        assert!(task.dependencies().contains(TaskId::new(1, 0)));
        assert_eq!(task.retry_policy().unwrap().timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn sequential_stops_at_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seq = Sequential::new()
            .then(recorder(&log, "one"))
            .then(TaskFn::new(|_ctx| async { Err(TaskError::permanent("two failed")) }))
            .then(recorder(&log, "three"));

        let err = seq.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(*log.lock().unwrap(), vec!["one"]);
    }

    #[tokio::test]
    async fn parallel_joins_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let par = Parallel::new()
            .with(recorder(&log, "ok"))
            .with(TaskFn::new(|_ctx| async { Err(TaskError::from("a")) }))
            .with(TaskFn::new(|_ctx| async { Err(TaskError::permanent("b")) }));

        let err = par.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.to_string(), "a; b");
        assert_eq!(*log.lock().unwrap(), vec!["ok"]);
    }

    #[tokio::test]
    async fn parallel_of_transient_errors_stays_transient() {
        let par = Parallel::new()
            .with(TaskFn::new(|_ctx| async { Err(TaskError::from("a")) }))
            .with(TaskFn::new(|_ctx| async { Err(TaskError::from("b")) }));

        assert!(par.run(CancellationToken::new()).await.unwrap_err().is_retryable());
    }
}
