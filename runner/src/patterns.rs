pub mod pipeline;
pub mod replica_exchange;
pub mod simulation_analysis;
#[cfg(test)]
mod testing;

use crate::{
    batching::{plan_waves, BatchError},
    checkpoint::CheckpointError,
    config::{ConfigErrors, PatternConfig},
    executors::{ExecutorError, Gateway, ResourceState},
    kernel::{Kernel, KernelRegistry},
    replica::{CycleCursor, ReplicaError},
    shared::SharedData,
    stage::Stage,
    task::{StagingDirective, TaskDescriptor, UnitOutcome, UnitState},
    telemetry::TimingRecorder,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Capacity(#[from] BatchError),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Backend failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error("Run was interrupted")]
    Interrupted,
}

#[derive(Clone, Debug, PartialEq)]
/// A unit that did not finish successfully. Recorded, never raised.
pub struct FailedUnit {
    pub uid: String,
    pub name: String,
    pub phase: String,
    pub tag: String,
    pub state: UnitState,
    pub stderr: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub units: usize,
    pub waves: usize,
    pub cycle_steps: usize,
    pub failed: Vec<FailedUnit>,
    /// cursor after the last completed cycle step of a replica exchange run
    pub final_cursor: Option<CycleCursor>,
}

/// Everything a pattern needs to run: the backend, the kernel registry, telemetry and the
/// interrupt flag. Owns the gateway so deallocation happens in exactly one place.
pub struct ExecutionContext<G: Gateway> {
    gateway: G,
    registry: KernelRegistry,
    recorder: TimingRecorder,
    shared: SharedData,
    total_cores: usize,
    wave_timeout: Option<Duration>,
    interrupt: Arc<AtomicBool>,
    // staged once, read only afterwards
    unit_directives: Vec<StagingDirective>,
    summary: RunSummary,
}

impl<G: Gateway> ExecutionContext<G> {
    pub fn new(
        gateway: G,
        registry: KernelRegistry,
        recorder: TimingRecorder,
        shared: SharedData,
        total_cores: usize,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            gateway,
            registry,
            recorder,
            shared,
            total_cores,
            wave_timeout: None,
            interrupt,
            unit_directives: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn with_wave_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wave_timeout = timeout;
        self
    }

    pub fn recorder(&mut self) -> &mut TimingRecorder {
        &mut self.recorder
    }

    pub fn check_interrupt(&self) -> Result<(), EngineError> {
        if self.interrupt.load(Ordering::SeqCst) {
            Err(EngineError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Move the shared data into the staging area of the allocation
    pub fn stage_shared_data(&mut self) -> Result<(), EngineError> {
        self.check_interrupt()?;
        self.recorder.start("stage_shared_data", "init");

        for directive in self.shared.allocation_directives() {
            self.gateway.stage_in(&directive)?;
        }
        self.unit_directives = self.shared.unit_directives();
        debug!("Staged {} shared files", self.unit_directives.len());

        self.recorder.end("stage_shared_data", "init");

        Ok(())
    }

    pub fn wait_resource_active(&mut self) -> Result<(), EngineError> {
        self.check_interrupt()?;
        self.recorder.start("wait_resource_active", "init");
        self.gateway.wait_resource_active(ResourceState::Active)?;
        self.recorder.end("wait_resource_active", "init");

        Ok(())
    }

    /// bind a kernel invocation, every unit gets a copy of the shared data
    pub fn bind(&self, unit_name: String, kernel: &Kernel) -> Result<TaskDescriptor, EngineError> {
        Ok(self
            .registry
            .bind(unit_name, kernel, &self.unit_directives)?)
    }

    /// Submit one wave and block until all of its units are terminal. Failed units are
    /// recorded and logged, the caller always gets every outcome.
    pub fn run_wave(
        &mut self,
        phase: &str,
        tag: &str,
        wave: Vec<TaskDescriptor>,
    ) -> Result<Vec<UnitOutcome>, EngineError> {
        self.check_interrupt()?;

        self.recorder.start(phase, tag);
        let handles = self.gateway.submit(wave)?;
        let outcomes = self.gateway.wait(&handles, self.wave_timeout)?;
        self.recorder.units(tag, &outcomes);
        self.recorder.end(phase, tag);

        self.summary.waves += 1;
        self.audit(phase, tag, &outcomes);
        self.check_interrupt()?;

        Ok(outcomes)
    }

    /// Batch `groups` into waves fitting the core budget and run them one after another.
    /// Outcomes follow the order of the flattened groups.
    pub fn run_batched(
        &mut self,
        phase: &str,
        tag: &str,
        groups: Vec<Vec<TaskDescriptor>>,
        per_replica_cores: usize,
    ) -> Result<Vec<UnitOutcome>, EngineError> {
        let waves = plan_waves(groups, per_replica_cores, self.total_cores)?;
        let mut outcomes = Vec::new();

        debug!(phase, tag, waves = waves.len(), "Planned waves");

        for wave in waves {
            let descriptors = wave.groups.into_iter().flatten().collect();
            outcomes.extend(self.run_wave(phase, tag, descriptors)?);
        }

        Ok(outcomes)
    }

    /// Run every pending task of `stage`, one task per group
    pub fn run_stage(
        &mut self,
        stage: &mut Stage,
        tag: &str,
        per_task_cores: usize,
    ) -> Result<(), EngineError> {
        if stage.is_empty() {
            debug!(stage = %stage.name, "Stage has no tasks");
            stage.set_task_state(UnitState::Done);
            return Ok(());
        }

        let (uids, descriptors): (Vec<_>, Vec<_>) = stage.pending().into_iter().unzip();
        debug!(stage = %stage.name, tasks = stage.len(), pending = uids.len(), "Running stage");
        stage.mark_scheduled();

        let groups = descriptors.into_iter().map(|descriptor| vec![descriptor]).collect();
        let outcomes = match self.run_batched(&stage.name, tag, groups, per_task_cores) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                stage.set_task_state(UnitState::Canceled);
                return Err(e);
            }
        };

        for (uid, outcome) in uids.iter().zip(outcomes.iter()) {
            stage.record(uid, outcome);
        }

        Ok(())
    }

    fn audit(&mut self, phase: &str, tag: &str, outcomes: &[UnitOutcome]) {
        self.summary.units += outcomes.len();

        for outcome in outcomes.iter().filter(|outcome| !outcome.state.is_done()) {
            error!(
                unit = %outcome.handle.uid,
                name = %outcome.handle.name,
                phase,
                tag,
                state = %outcome.state,
                "Unit did not finish: {}",
                outcome.stderr_tail()
            );

            self.summary.failed.push(FailedUnit {
                uid: outcome.handle.uid.clone(),
                name: outcome.handle.name.clone(),
                phase: phase.to_owned(),
                tag: tag.to_owned(),
                state: outcome.state,
                stderr: outcome.stderr_tail().to_owned(),
            });
        }
    }

    pub fn complete_cycle_step(&mut self, cursor: CycleCursor) {
        self.summary.cycle_steps += 1;
        self.summary.final_cursor = Some(cursor);
    }

    /// Release the allocation and close telemetry. Runs on every exit path.
    pub fn close(mut self) -> RunSummary {
        if let Err(e) = self.gateway.deallocate() {
            error!("Failed to deallocate the resource: {e}");
        }
        self.recorder.close();

        info!(
            units = self.summary.units,
            failed = self.summary.failed.len(),
            "Released the allocation"
        );

        self.summary
    }

    #[cfg(test)]
    fn gateway(&self) -> &G {
        &self.gateway
    }

    #[cfg(test)]
    fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }
}

/// Closed set of execution patterns, selected by the configuration
#[derive(Debug)]
pub enum Pattern {
    ReplicaExchange(replica_exchange::ReplicaExchange),
    Pipeline(pipeline::EnsembleOfPipelines),
    SimulationAnalysis(simulation_analysis::SimulationAnalysisLoop),
}

impl Pattern {
    /// Build the pattern, a replica exchange run resumes from its checkpoint with `restart`
    pub fn load(config: &PatternConfig, restart: bool) -> Result<Self, EngineError> {
        Ok(match config {
            PatternConfig::ReplicaExchange(config) => Self::ReplicaExchange(
                replica_exchange::ReplicaExchange::restore(config.clone(), restart)?,
            ),
            PatternConfig::Pipeline(config) => {
                Self::Pipeline(pipeline::EnsembleOfPipelines::new(config.clone()))
            }
            PatternConfig::SimulationAnalysis(config) => Self::SimulationAnalysis(
                simulation_analysis::SimulationAnalysisLoop::new(config.clone()),
            ),
        })
    }

    pub fn execute<G: Gateway>(&mut self, context: &mut ExecutionContext<G>) -> Result<(), EngineError> {
        match self {
            Self::ReplicaExchange(pattern) => pattern.execute(context),
            Self::Pipeline(pattern) => pattern.execute(context),
            Self::SimulationAnalysis(pattern) => pattern.execute(context),
        }
    }
}

/// Sandbox of the referenced unit with the same instance, falling back to the first instance
pub(crate) fn reference(sandboxes: &[String], instance: usize) -> Option<&String> {
    sandboxes
        .get(instance.saturating_sub(1))
        .or_else(|| sandboxes.first())
}

#[cfg(test)]
mod tests {
    use super::{testing::*, *};

    #[test]
    fn failed_units_are_recorded() {
        let (mut context, _) = context(4, |descriptor| {
            if descriptor.name == "b" {
                (UnitState::Failed, "boom".to_owned())
            } else {
                (UnitState::Done, String::new())
            }
        });

        let outcomes = context
            .run_wave("md", "c1_d0", vec![descriptor("a", 1), descriptor("b", 1)])
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        let summary = context.close();
        assert_eq!(summary.units, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].name, "b");
        assert_eq!(summary.failed[0].stderr, "boom");
        assert_eq!(summary.failed[0].phase, "md");
    }

    #[test]
    fn batches_respect_budget() {
        let (mut context, _) = context(4, |_| (UnitState::Done, String::new()));
        let groups = (0..10)
            .map(|index| vec![descriptor(&format!("u{index}"), 1)])
            .collect();

        let outcomes = context.run_batched("md", "c1_d0", groups, 1).unwrap();

        assert_eq!(outcomes.len(), 10);
        assert_eq!(outcomes[9].handle.name, "u9");
        assert_eq!(context.gateway().wave_sizes(), vec![4, 4, 2]);
    }

    #[test]
    fn interrupt_stops_before_submission() {
        let (mut context, interrupt) = context(4, |_| (UnitState::Done, String::new()));
        interrupt.store(true, Ordering::SeqCst);

        assert!(matches!(
            context.run_wave("md", "c1_d0", vec![descriptor("a", 1)]),
            Err(EngineError::Interrupted)
        ));
        assert!(context.gateway().waves.is_empty());
        assert!(context.close().failed.is_empty());
    }

    #[test]
    fn empty_stage_is_done() {
        let (mut context, _) = context(4, |_| (UnitState::Done, String::new()));
        let mut stage = Stage::new("empty");

        context.run_stage(&mut stage, "s1", 1).unwrap();

        assert_eq!(stage.state, UnitState::Done);
        assert!(context.gateway().waves.is_empty());
    }

    #[test]
    fn reference_falls_back_to_first_instance() {
        let sandboxes = vec!["/a".to_owned(), "/b".to_owned()];

        assert_eq!(reference(&sandboxes, 2), Some(&"/b".to_owned()));
        assert_eq!(reference(&sandboxes, 5), Some(&"/a".to_owned()));
        assert_eq!(reference(&[], 1), None);
    }
}
