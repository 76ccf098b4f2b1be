use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::cycle_check::find_cycle;
use crate::executor::{Execution, RunOptions, RunReport};
use crate::task::{Action, SkipFn};
use crate::{FlowError, Graph, RetryPolicy};

pub(crate) struct CompiledTask {
    pub(crate) name: String,
    pub(crate) action: Arc<dyn Action>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) skip_if: Option<SkipFn>,
    pub(crate) wait: bool,
    pub(crate) predecessors: Vec<usize>,
    pub(crate) successors: Vec<usize>,
    pub(crate) layer: usize,
}

pub(crate) struct PlanInner {
    pub(crate) name: String,
    pub(crate) tasks: Vec<CompiledTask>,
}

/// Immutable, executable form of a [`Graph`]. Cloning is cheap and running
/// never mutates the plan, so it can be run repeatedly and concurrently.
#[derive(Clone)]
pub struct Plan {
    pub(crate) inner: Arc<PlanInner>,
}

impl Plan {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.is_empty()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.inner.tasks.iter().map(|t| t.name.as_str())
    }

    /// Length of the longest dependency chain leading to the task.
    pub fn layer(&self, task_name: &str) -> Option<usize> {
        self.inner
            .tasks
            .iter()
            .find(|t| t.name == task_name)
            .map(|t| t.layer)
    }

    /// Task names ordered by layer, then by insertion order.
    pub fn tasks_by_layer(&self) -> Vec<(usize, &str)> {
        let mut ordered: Vec<(usize, usize, &str)> = self
            .inner
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.layer, i, t.name.as_str()))
            .collect();
        ordered.sort_unstable();
        ordered
            .into_iter()
            .map(|(layer, _, name)| (layer, name))
            .collect()
    }

    /// Names of the direct dependencies of `task_name`.
    pub fn dependencies_of(&self, task_name: &str) -> Option<Vec<&str>> {
        let task = self.inner.tasks.iter().find(|t| t.name == task_name)?;
        Some(
            task.predecessors
                .iter()
                .map(|&p| self.inner.tasks[p].name.as_str())
                .collect(),
        )
    }

    pub async fn run(&self, ctx: CancellationToken, opts: RunOptions) -> RunReport {
        let (execution, completions) = Execution::new(Arc::clone(&self.inner), ctx, opts);
        execution.run(completions).await
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("name", &self.inner.name)
            .field("tasks", &self.tasks_by_layer())
            .finish()
    }
}

pub(crate) fn compile(graph: Graph) -> Result<Plan, FlowError> {
    let key = graph.key();
    let Graph { name, tasks, .. } = graph;
    let count = tasks.len();

    let mut predecessors: Vec<Vec<usize>> = Vec::with_capacity(count);
    for task in &tasks {
        let mut preds = Vec::with_capacity(task.dependencies.len());
        for dep in task.dependencies.iter() {
            if dep.graph != key || dep.index() >= count {
                error!(flow = %name, task = %task.name, dependency = %dep, "Dangling dependency in graph");
                return Err(FlowError::InvariantViolation(format!(
                    "task {:?} of flow {:?} references task {} outside the graph",
                    task.name, name, dep
                )));
            }
            preds.push(dep.index());
        }
        predecessors.push(preds);
    }

    if let Some(cycle) = find_cycle(&predecessors) {
        let path = cycle
            .iter()
            .map(|&i| format!("{:?}", tasks[i].name))
            .collect::<Vec<_>>()
            .join(" -> ");
        error!(flow = %name, cycle = %path, "Dependency cycle in graph");
        return Err(FlowError::InvariantViolation(format!(
            "dependency cycle in flow {:?}: {}",
            name, path
        )));
    }

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (index, preds) in predecessors.iter().enumerate() {
        for &p in preds {
            successors[p].push(index);
        }
    }

    let layers = compute_layers(&predecessors, &successors);

    let compiled: Vec<CompiledTask> = tasks
        .into_iter()
        .zip(predecessors)
        .zip(successors)
        .zip(layers)
        .map(|(((task, predecessors), successors), layer)| CompiledTask {
            name: task.name,
            action: task.action,
            retry_policy: task.retry_policy,
            skip_if: task.skip_if,
            wait: task.wait,
            predecessors,
            successors,
            layer,
        })
        .collect();

    let plan = Plan {
        inner: Arc::new(PlanInner {
            name,
            tasks: compiled,
        }),
    };
    for (layer, task) in plan.tasks_by_layer() {
        debug!(flow = %plan.name(), task = %task, layer, "Compiled task");
    }
    Ok(plan)
}

// Kahn's order over an acyclic graph; each task's layer is one more than the
// deepest of its predecessors.
fn compute_layers(predecessors: &[Vec<usize>], successors: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
    let mut layers = vec![0; predecessors.len()];
    let mut queue: VecDeque<usize> = (0..predecessors.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();

    while let Some(index) = queue.pop_front() {
        for &succ in &successors[index] {
            layers[succ] = layers[succ].max(layers[index] + 1);
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                queue.push_back(succ);
            }
        }
    }

    layers
}
