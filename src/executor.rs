use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::plan::PlanInner;
use crate::progress::{ProgressReporter, Stats};
use crate::task::Action;
use crate::{
    AggregatedError, ErrorContext, FlowError, RetryExecutor, RetryPolicy, TaskError, TaskState,
};

/// Called with the name of a task that failed in an earlier attempt and has
/// now succeeded, so persisted error records can be cleared.
pub type ErrorCleaner = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RunOptions {
    pub progress_reporter: Option<Arc<dyn ProgressReporter>>,
    pub error_cleaner: Option<ErrorCleaner>,
    pub error_context: Option<ErrorContext>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    pub fn with_error_cleaner(mut self, cleaner: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.error_cleaner = Some(Arc::new(cleaner));
        self
    }

    pub fn with_error_context(mut self, context: ErrorContext) -> Self {
        self.error_context = Some(context);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("progress_reporter", &self.progress_reporter.is_some())
            .field("error_cleaner", &self.error_cleaner.is_some())
            .field("error_context", &self.error_context)
            .finish()
    }
}

/// Outcome of one run: final state of every task plus the collected errors.
#[derive(Debug)]
pub struct RunReport {
    flow_name: String,
    tasks: Vec<(String, TaskState)>,
    errors: AggregatedError,
    error_context: Option<ErrorContext>,
    cancelled: bool,
    elapsed: Duration,
}

impl RunReport {
    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn state(&self, task_name: &str) -> Option<TaskState> {
        self.tasks
            .iter()
            .find(|(name, _)| name == task_name)
            .map(|(_, state)| *state)
    }

    pub fn states(&self) -> &[(String, TaskState)] {
        &self.tasks
    }

    pub fn tasks_in(&self, state: TaskState) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|(_, s)| *s == state)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn errors(&self) -> &AggregatedError {
        &self.errors
    }

    /// The error context passed in, updated with this run's failures and
    /// cleared of tasks that recovered.
    pub fn error_context(&self) -> Option<&ErrorContext> {
        self.error_context.as_ref()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }

    pub fn into_result(self) -> Result<(), FlowError> {
        if !self.errors.is_empty() {
            return Err(FlowError::TaskFailures(self.errors));
        }
        if self.cancelled && self.tasks.iter().any(|(_, s)| !s.is_terminal()) {
            return Err(FlowError::Cancelled(self.flow_name));
        }
        Ok(())
    }
}

pub(crate) struct Completion {
    index: usize,
    result: Result<(), TaskError>,
    elapsed: Duration,
}

/// Mutable state of a single run. Owned by the scheduling loop; workers only
/// talk back through the completion channel.
pub(crate) struct Execution {
    plan: Arc<PlanInner>,
    ctx: CancellationToken,
    opts: RunOptions,
    states: Vec<TaskState>,
    remaining: Vec<usize>,
    upstream_failed: Vec<bool>,
    ready: Vec<usize>,
    running: usize,
    cancelled: bool,
    errors: AggregatedError,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl Execution {
    pub(crate) fn new(
        plan: Arc<PlanInner>,
        ctx: CancellationToken,
        opts: RunOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let count = plan.tasks.len();
        let remaining = plan.tasks.iter().map(|t| t.predecessors.len()).collect();
        let ready = (0..count)
            .rev()
            .filter(|&i| plan.tasks[i].predecessors.is_empty())
            .collect();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let execution = Self {
            errors: AggregatedError::new(plan.name.clone()),
            plan,
            ctx,
            opts,
            states: vec![TaskState::Pending; count],
            remaining,
            upstream_failed: vec![false; count],
            ready,
            running: 0,
            cancelled: false,
            completion_tx,
        };
        (execution, completion_rx)
    }

    pub(crate) async fn run(
        mut self,
        mut completion_rx: mpsc::UnboundedReceiver<Completion>,
    ) -> RunReport {
        let started = Instant::now();
        let ctx = self.ctx.clone();

        info!(flow = %self.plan.name, tasks = self.plan.tasks.len(), "Starting flow");
        if let Some(reporter) = &self.opts.progress_reporter {
            reporter.start();
        }
        self.report(None);

        self.cancelled = ctx.is_cancelled();
        self.schedule_ready();

        while self.running > 0 {
            tokio::select! {
                biased;
                completion = completion_rx.recv() => match completion {
                    Some(completion) => {
                        self.complete(completion);
                        self.schedule_ready();
                    }
                    None => break,
                },
                _ = ctx.cancelled(), if !self.cancelled => {
                    self.cancelled = true;
                    warn!(
                        flow = %self.plan.name,
                        running = self.running,
                        "Flow cancelled, waiting for running tasks"
                    );
                }
            }
        }

        if let Some(reporter) = &self.opts.progress_reporter {
            reporter.stop().await;
        }

        let elapsed = started.elapsed();
        if self.errors.is_empty() && !self.cancelled {
            info!(flow = %self.plan.name, ?elapsed, "Flow finished successfully");
        } else {
            error!(
                flow = %self.plan.name,
                ?elapsed,
                cancelled = self.cancelled,
                failed = ?self.errors.task_names(),
                "Flow finished with errors"
            );
        }

        RunReport {
            flow_name: self.plan.name.clone(),
            tasks: self
                .plan
                .tasks
                .iter()
                .map(|t| t.name.clone())
                .zip(self.states)
                .collect(),
            errors: self.errors,
            error_context: self.opts.error_context,
            cancelled: self.cancelled,
            elapsed,
        }
    }

    // Decides the fate of every task whose dependencies have all settled:
    // launch it, skip it, or block it behind a failed dependency.
    fn schedule_ready(&mut self) {
        let plan = Arc::clone(&self.plan);

        while let Some(index) = self.ready.pop() {
            if self.cancelled || self.ctx.is_cancelled() {
                self.cancelled = true;
                self.ready.clear();
                return;
            }

            let task = &plan.tasks[index];
            let skip = match &task.skip_if {
                Some(skip_if) => match catch_unwind(AssertUnwindSafe(|| skip_if())) {
                    Ok(skip) => skip,
                    Err(panic) => {
                        let err = TaskError::permanent(format!(
                            "skip predicate panicked: {}",
                            panic_message(&*panic)
                        ));
                        self.fail(index, err, Duration::ZERO);
                        continue;
                    }
                },
                None => false,
            };

            if skip {
                info!(flow = %plan.name, task = %task.name, "Skipped");
                self.settle(index, TaskState::Skipped);
            } else if self.upstream_failed[index] {
                info!(flow = %plan.name, task = %task.name, "Blocked by failed dependency");
                self.settle(index, TaskState::BlockedBySkip);
            } else {
                self.launch(index);
            }
        }
    }

    fn launch(&mut self, index: usize) {
        let task = &self.plan.tasks[index];
        let name = task.name.clone();
        let action = Arc::clone(&task.action);
        let policy = task.retry_policy.clone();
        let ctx = self.ctx.clone();
        let tx = self.completion_tx.clone();

        if task.wait {
            debug!(flow = %self.plan.name, task = %name, "Waiting");
        }
        info!(flow = %self.plan.name, task = %name, layer = task.layer, "Started");

        self.states[index] = TaskState::Running;
        self.running += 1;
        self.report(Some(index));

        tokio::spawn(async move {
            let started = Instant::now();
            let result = AssertUnwindSafe(execute_task(&ctx, &name, action, policy))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(TaskError::permanent(format!(
                        "task panicked: {}",
                        panic_message(&*panic)
                    )))
                });
            // the scheduling loop holds a receiver until every worker reported back
            let _ = tx.send(Completion {
                index,
                result,
                elapsed: started.elapsed(),
            });
        });
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            index,
            result,
            elapsed,
        } = completion;
        let plan = Arc::clone(&self.plan);
        let name = plan.tasks[index].name.as_str();
        self.running -= 1;

        match result {
            Ok(()) => {
                info!(flow = %plan.name, task = %name, ?elapsed, "Succeeded");
                if let Some(context) = self.opts.error_context.as_mut() {
                    if context.remove_error_id(name) {
                        debug!(flow = %plan.name, task = %name, "Clearing error of previous attempt");
                        if let Some(cleaner) = &self.opts.error_cleaner {
                            cleaner(name);
                        }
                    }
                }
                self.settle(index, TaskState::Succeeded);
            }
            Err(err) => self.fail(index, err, elapsed),
        }
    }

    fn fail(&mut self, index: usize, err: TaskError, elapsed: Duration) {
        let plan = Arc::clone(&self.plan);
        let name = plan.tasks[index].name.as_str();

        if err.is_cancelled() {
            warn!(flow = %plan.name, task = %name, ?elapsed, "Cancelled");
        } else {
            error!(flow = %plan.name, task = %name, ?elapsed, error = %err, "Failed");
        }
        if let Some(context) = self.opts.error_context.as_mut() {
            context.add_error_id(name);
        }
        self.errors.add(name, err);
        self.settle(index, TaskState::Failed);
    }

    fn settle(&mut self, index: usize, state: TaskState) {
        self.states[index] = state;
        self.report(Some(index));

        let plan = Arc::clone(&self.plan);
        for &succ in &plan.tasks[index].successors {
            if !state.unblocks_dependents() {
                self.upstream_failed[succ] = true;
            }
            self.remaining[succ] -= 1;
            if self.remaining[succ] == 0 {
                self.ready.push(succ);
            }
        }
    }

    fn report(&self, transitioned: Option<usize>) {
        let Some(reporter) = &self.opts.progress_reporter else {
            return;
        };

        let mut stats = Stats {
            flow_name: self.plan.name.clone(),
            all: self.plan.tasks.len(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            blocked: Vec::new(),
            running: Vec::new(),
            pending: Vec::new(),
            last_transition: transitioned
                .map(|i| (self.plan.tasks[i].name.clone(), self.states[i])),
        };
        for (task, state) in self.plan.tasks.iter().zip(&self.states) {
            let bucket = match state {
                TaskState::Pending => &mut stats.pending,
                TaskState::Running => &mut stats.running,
                TaskState::Succeeded => &mut stats.succeeded,
                TaskState::Failed => &mut stats.failed,
                TaskState::Skipped => &mut stats.skipped,
                TaskState::BlockedBySkip => &mut stats.blocked,
            };
            bucket.push(task.name.clone());
        }
        reporter.report(stats);
    }
}

async fn execute_task(
    ctx: &CancellationToken,
    name: &str,
    action: Arc<dyn Action>,
    policy: Option<RetryPolicy>,
) -> Result<(), TaskError> {
    match policy {
        Some(policy) => {
            RetryExecutor::new(policy)
                .execute_with_retry(ctx, name, |attempt_ctx, _attempt| {
                    let action = Arc::clone(&action);
                    async move { action.run(attempt_ctx).await }
                })
                .await
        }
        None => {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(TaskError::Cancelled),
                result = action.run(ctx.clone()) => result,
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
