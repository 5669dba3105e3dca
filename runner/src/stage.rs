use crate::task::{TaskDescriptor, UnitHandle, UnitOutcome, UnitState};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, warn};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// process wide unique id, e.g. `task.000042`
fn generate_uid(prefix: &str) -> String {
    format!("{prefix}.{:06}", NEXT_UID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub uid: String,
    pub descriptor: TaskDescriptor,
    pub state: UnitState,
    /// set once the backend accepted the task
    pub handle: Option<UnitHandle>,
    pub parent_stage: Option<String>,
    pub parent_pipeline: Option<String>,
}

impl Task {
    pub fn new(descriptor: TaskDescriptor) -> Self {
        Self {
            uid: generate_uid("task"),
            descriptor,
            state: UnitState::New,
            handle: None,
            parent_stage: None,
            parent_pipeline: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn sandbox(&self) -> Option<&str> {
        self.handle.as_ref().map(|handle| handle.sandbox.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
/// Set of tasks that run concurrently, keyed by task uid
pub struct Stage {
    pub uid: String,
    pub name: String,
    tasks: BTreeMap<String, Task>,
    pub state: UnitState,
    pub parent_pipeline: Option<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uid: generate_uid("stage"),
            name: name.into(),
            tasks: BTreeMap::new(),
            state: UnitState::New,
            parent_pipeline: None,
        }
    }

    /// Adding a task that is already part of the stage replaces it
    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) {
        for mut task in tasks {
            task.parent_stage = Some(self.uid.clone());
            task.parent_pipeline = self.parent_pipeline.clone();

            debug!(stage = %self.uid, task = %task.uid, name = task.name(), "Adding task");
            if self.tasks.insert(task.uid.clone(), task).is_some() {
                debug!(stage = %self.uid, "Task was already part of the stage, replaced it");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, uid: &str) -> Option<&Task> {
        self.tasks.get(uid)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// broadcast `state` to the stage and every task in it
    pub fn set_task_state(&mut self, state: UnitState) {
        self.state = state;

        for task in self.tasks.values_mut() {
            task.state = state;
        }
    }

    /// true iff every task finished successfully
    pub fn check_tasks_status(&self) -> bool {
        self.tasks.values().all(|task| task.state.is_done())
    }

    /// hand the stage's uids down to its tasks after it joined a pipeline
    pub fn pass_uid(&mut self) {
        for task in self.tasks.values_mut() {
            task.parent_stage = Some(self.uid.clone());
            task.parent_pipeline = self.parent_pipeline.clone();
        }
    }

    /// Task uids and descriptors of all tasks that weren't submitted yet
    pub fn pending(&self) -> Vec<(String, TaskDescriptor)> {
        self.tasks
            .values()
            .filter(|task| task.state == UnitState::New)
            .map(|task| (task.uid.clone(), task.descriptor.clone()))
            .collect()
    }

    pub fn mark_scheduled(&mut self) {
        for task in self.tasks.values_mut() {
            if task.state == UnitState::New {
                task.state = UnitState::Scheduled;
            }
        }
        self.state = UnitState::Scheduled;
    }

    /// Store the terminal outcome of a task and derive the stage state once all tasks are terminal
    pub fn record(&mut self, uid: &str, outcome: &UnitOutcome) {
        match self.tasks.get_mut(uid) {
            Some(task) => {
                task.state = outcome.state;
                task.handle = Some(outcome.handle.clone());
            }
            None => warn!(stage = %self.uid, "Outcome for unknown task {uid}"),
        }

        if self.tasks.values().all(|task| task.state.is_terminal()) {
            self.state = if self.check_tasks_status() {
                UnitState::Done
            } else {
                UnitState::Failed
            };
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
/// Ordered stages, stage `n + 1` only starts once stage `n` is terminal
pub struct Pipeline {
    pub uid: String,
    pub name: String,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uid: generate_uid("pipeline"),
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn add_stages(&mut self, stages: impl IntoIterator<Item = Stage>) {
        for mut stage in stages {
            stage.parent_pipeline = Some(self.uid.clone());
            stage.pass_uid();
            self.stages.push(stage);
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[cfg(test)]
    pub fn stage_mut(&mut self, index: usize) -> Option<&mut Stage> {
        self.stages.get_mut(index)
    }

    pub fn last_stage_mut(&mut self) -> Option<&mut Stage> {
        self.stages.last_mut()
    }

    /// true once every stage is terminal
    pub fn completed(&self) -> bool {
        self.stages.iter().all(|stage| stage.state.is_terminal())
    }
}
