use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::plan::{self, Plan};
use crate::{FlowError, Task, TaskId};

/// Builder for a flow. Tasks can only depend on tasks added before them,
/// so the dependency relation stays acyclic by construction.
pub struct Graph {
    pub(crate) name: String,
    pub(crate) tasks: Vec<Task>,
    pub(crate) names: HashMap<String, TaskId>,
    // Address of this allocation tags every TaskId the graph hands out.
    identity: Arc<()>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            names: HashMap::new(),
            identity: Arc::new(()),
        }
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.identity) as usize
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn add_task(&mut self, task: Task) -> Result<TaskId, FlowError> {
        if self.names.contains_key(&task.name) {
            return Err(FlowError::DuplicateTaskName(task.name));
        }
        if let Some(dependency) = task
            .dependencies
            .iter()
            .find(|dep| dep.graph != self.key() || dep.index() >= self.tasks.len())
        {
            return Err(FlowError::UnknownDependency {
                task: task.name,
                dependency,
            });
        }

        let id = TaskId::new(self.key(), self.tasks.len());
        debug!(
            flow = %self.name,
            task = %task.name,
            id = %id,
            dependencies = task.dependencies.len(),
            "Added task"
        );
        self.names.insert(task.name.clone(), id);
        self.tasks.push(task);
        Ok(id)
    }

    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.names.get(name).copied()
    }

    pub fn compile(self) -> Result<Plan, FlowError> {
        plan::compile(self)
    }
}
