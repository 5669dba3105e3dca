//! In-memory gateway that answers every unit from a script, used by the pattern tests

use super::ExecutionContext;
use crate::{
    config::{KernelConfig, MachineConfig},
    executors::{ExecutorError, Gateway, ResourceState},
    kernel::KernelRegistry,
    shared::SharedData,
    task::{StagingDirective, TaskDescriptor, UnitHandle, UnitOutcome, UnitState},
    telemetry::TimingRecorder,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Decides the terminal state and the output of a unit. Output of a successful unit ends up on
/// stdout, everything else on stderr.
pub type Script = Box<dyn FnMut(&TaskDescriptor) -> (UnitState, String)>;

pub const KERNELS: [&str; 6] = ["md", "exchange", "global", "sim", "ana", "misc"];

pub struct ScriptedGateway {
    pub waves: Vec<Vec<TaskDescriptor>>,
    pub staged: Vec<StagingDirective>,
    pub deallocated: bool,
    /// raise the flag as soon as a unit with this name is submitted
    pub interrupt_on: Option<(String, Arc<AtomicBool>)>,
    script: Script,
    pending: BTreeMap<String, UnitOutcome>,
    counter: usize,
}

impl ScriptedGateway {
    pub fn new(script: Script) -> Self {
        Self {
            waves: Vec::new(),
            staged: Vec::new(),
            deallocated: false,
            interrupt_on: None,
            script,
            pending: BTreeMap::new(),
            counter: 0,
        }
    }

    pub fn wave_sizes(&self) -> Vec<usize> {
        self.waves.iter().map(Vec::len).collect()
    }

    pub fn names(&self) -> Vec<Vec<String>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().map(|descriptor| descriptor.name.clone()).collect())
            .collect()
    }
}

impl Gateway for ScriptedGateway {
    fn stage_in(&mut self, directive: &StagingDirective) -> Result<(), ExecutorError> {
        self.staged.push(directive.clone());
        Ok(())
    }

    fn wait_resource_active(&mut self, target: ResourceState) -> Result<(), ExecutorError> {
        if self.deallocated {
            return Err(ExecutorError::Inactive(ResourceState::Done));
        }
        assert_eq!(target, ResourceState::Active);
        Ok(())
    }

    fn submit(&mut self, wave: Vec<TaskDescriptor>) -> Result<Vec<UnitHandle>, ExecutorError> {
        let mut handles = Vec::new();

        for descriptor in wave.iter() {
            self.counter += 1;
            let uid = format!("unit.{:06}", self.counter);
            let handle = UnitHandle {
                uid: uid.clone(),
                name: descriptor.name.clone(),
                sandbox: format!("/sandbox/{uid}"),
            };
            let (state, output) = (self.script)(descriptor);
            let (stdout, stderr) = if state.is_done() {
                (output, String::new())
            } else {
                (String::new(), output)
            };

            if let Some((ref name, ref flag)) = self.interrupt_on {
                if *name == descriptor.name {
                    flag.store(true, Ordering::SeqCst);
                }
            }

            self.pending.insert(
                uid,
                UnitOutcome {
                    handle: handle.clone(),
                    state,
                    stdout,
                    stderr,
                    runtime: Duration::from_millis(10),
                },
            );
            handles.push(handle);
        }

        self.waves.push(wave);

        Ok(handles)
    }

    fn wait(
        &mut self,
        handles: &[UnitHandle],
        _timeout: Option<Duration>,
    ) -> Result<Vec<UnitOutcome>, ExecutorError> {
        handles
            .iter()
            .map(|handle| {
                self.pending
                    .remove(&handle.uid)
                    .ok_or_else(|| ExecutorError::UnknownUnit(handle.uid.clone()))
            })
            .collect()
    }

    fn deallocate(&mut self) -> Result<(), ExecutorError> {
        self.deallocated = true;
        Ok(())
    }
}

pub fn registry() -> KernelRegistry {
    let kernels = KERNELS
        .iter()
        .map(|name| {
            (
                name.to_string(),
                KernelConfig {
                    machine_configs: BTreeMap::from([(
                        "*".to_owned(),
                        MachineConfig {
                            executable: format!("/usr/bin/{name}"),
                            ..MachineConfig::default()
                        },
                    )]),
                },
            )
        })
        .collect();

    KernelRegistry::new(kernels, "localhost")
}

pub fn descriptor(name: &str, cores: usize) -> TaskDescriptor {
    TaskDescriptor {
        name: name.to_owned(),
        executable: "/bin/true".to_owned(),
        cores,
        ..TaskDescriptor::default()
    }
}

pub fn context(
    total_cores: usize,
    script: impl FnMut(&TaskDescriptor) -> (UnitState, String) + 'static,
) -> (ExecutionContext<ScriptedGateway>, Arc<AtomicBool>) {
    let (recorder, _) = TimingRecorder::memory();

    context_with(total_cores, script, recorder, SharedData::default())
}

pub fn context_with(
    total_cores: usize,
    script: impl FnMut(&TaskDescriptor) -> (UnitState, String) + 'static,
    recorder: TimingRecorder,
    shared: SharedData,
) -> (ExecutionContext<ScriptedGateway>, Arc<AtomicBool>) {
    let interrupt = Arc::new(AtomicBool::new(false));
    let context = ExecutionContext::new(
        ScriptedGateway::new(Box::new(script)),
        registry(),
        recorder,
        shared,
        total_cores,
        interrupt.clone(),
    );

    (context, interrupt)
}
