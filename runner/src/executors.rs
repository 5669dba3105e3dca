pub mod local;

use crate::{
    config::{BackendConfig, ConfigErrors, ResourceConfig},
    task::{StagingDirective, TaskDescriptor, UnitHandle, UnitOutcome},
};
use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Backend I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unit {0} is unknown to the backend")]
    UnknownUnit(String),
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Resource is not active (state {0:?})")]
    Inactive(ResourceState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Pending,
    Active,
    Done,
}

/// Narrow surface of a resource management backend. Everything the engines submit goes
/// through here, any backend satisfying it is interchangeable.
pub trait Gateway {
    /// stage data into the allocation, before any unit runs
    fn stage_in(&mut self, directive: &StagingDirective) -> Result<(), ExecutorError>;

    /// block until the allocation reached `target`
    fn wait_resource_active(&mut self, target: ResourceState) -> Result<(), ExecutorError>;

    /// submit a wave, handles are returned in submission order
    fn submit(&mut self, wave: Vec<TaskDescriptor>) -> Result<Vec<UnitHandle>, ExecutorError>;

    /// Block until every handle is terminal. Outcomes follow the order of `handles`. Units
    /// still running after `timeout` or after an interrupt are canceled.
    fn wait(
        &mut self,
        handles: &[UnitHandle],
        timeout: Option<Duration>,
    ) -> Result<Vec<UnitOutcome>, ExecutorError>;

    /// release the allocation, canceling whatever is still running
    fn deallocate(&mut self) -> Result<(), ExecutorError>;
}

#[derive(Debug)]
/// All backends that can be selected in the configuration
pub enum Executors {
    Local(local::LocalExecutor),
}

impl Executors {
    /// Select the backend. Waiting units are canceled once `interrupt` is raised.
    pub fn load(
        backend: &BackendConfig,
        resource: &ResourceConfig,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self, ConfigErrors> {
        match backend.name.as_str() {
            "local" => Ok(Self::Local(local::LocalExecutor::load(backend, resource, interrupt)?)),
            _ => Err(ConfigErrors::UnsupportedBackend(backend.name.clone())),
        }
    }
}

impl Gateway for Executors {
    fn stage_in(&mut self, directive: &StagingDirective) -> Result<(), ExecutorError> {
        match self {
            Self::Local(executor) => executor.stage_in(directive),
        }
    }

    fn wait_resource_active(&mut self, target: ResourceState) -> Result<(), ExecutorError> {
        match self {
            Self::Local(executor) => executor.wait_resource_active(target),
        }
    }

    fn submit(&mut self, wave: Vec<TaskDescriptor>) -> Result<Vec<UnitHandle>, ExecutorError> {
        match self {
            Self::Local(executor) => executor.submit(wave),
        }
    }

    fn wait(
        &mut self,
        handles: &[UnitHandle],
        timeout: Option<Duration>,
    ) -> Result<Vec<UnitOutcome>, ExecutorError> {
        match self {
            Self::Local(executor) => executor.wait(handles, timeout),
        }
    }

    fn deallocate(&mut self) -> Result<(), ExecutorError> {
        match self {
            Self::Local(executor) => executor.deallocate(),
        }
    }
}
