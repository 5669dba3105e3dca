use super::{EngineError, ExecutionContext};
use crate::{
    batching::{plan_waves, BatchError},
    checkpoint::CheckpointRecord,
    config::{ConfigErrors, KernelTemplate, ReplicaExchangeConfig},
    exchange::SwapMatrix,
    executors::Gateway,
    kernel::{Kernel, TemplateVars},
    replica::{CycleCursor, Dimension, Group, Replica, ReplicaError, ReplicaId, ReplicaSet},
    task::{TaskDescriptor, UnitOutcome},
};
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    StageSharedData,
    WaitResourceActive,
    MdWave,
    ExchangeWave,
    GlobalExchange,
    PerformSwap,
    Checkpoint,
    Terminal,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
/// Replica counts of the waves a cycle step along one dimension submits
pub struct DimensionPlan {
    pub name: String,
    pub md_waves: Vec<usize>,
    pub exchange_waves: Vec<usize>,
}

#[derive(Debug)]
/// The replica exchange engine. Runs `nr_cycles` cycles, each cycle visits every dimension once.
pub struct ReplicaExchange {
    config: ReplicaExchangeConfig,
    dimensions: Vec<Dimension>,
    replicas: ReplicaSet,
    cursor: CycleCursor,
    state: EngineState,
}

impl ReplicaExchange {
    pub fn new(config: ReplicaExchangeConfig) -> Self {
        let dimensions = config
            .dimensions
            .iter()
            .map(|dimension| Dimension::from_config(dimension, config.replica_cores))
            .collect_vec();
        let replicas = ReplicaSet::new(&dimensions);
        if replicas.is_empty() {
            warn!("No replicas were created, every cycle step only runs the global exchange");
        }

        info!(
            replicas = replicas.len(),
            dimensions = dimensions.len(),
            cycles = config.nr_cycles,
            "Created replica exchange engine"
        );

        Self {
            config,
            dimensions,
            replicas,
            cursor: CycleCursor::default(),
            state: EngineState::Init,
        }
    }

    /// With `restart` the replicas and cursor are taken from the checkpoint if there is one
    pub fn restore(config: ReplicaExchangeConfig, restart: bool) -> Result<Self, EngineError> {
        let mut engine = Self::new(config);

        if !restart {
            return Ok(engine);
        }
        if !engine.config.checkpoint.exists() {
            warn!(
                "No checkpoint found at {:?}, starting from the first cycle",
                engine.config.checkpoint
            );
            return Ok(engine);
        }

        let record = CheckpointRecord::load(&engine.config.checkpoint)?;
        if record.replicas.len() != engine.replicas.len()
            || record.dimension_index >= engine.dimensions.len()
        {
            return Err(ReplicaError::Mismatch.into());
        }

        engine.cursor = record.cursor();
        engine.replicas = ReplicaSet::restore(record.replicas, &engine.dimensions)?;
        info!(
            cycle = engine.cursor.cycle,
            dim = engine.cursor.dim,
            "Resuming replica exchange"
        );

        Ok(engine)
    }

    #[cfg(test)]
    pub fn cursor(&self) -> CycleCursor {
        self.cursor
    }

    #[cfg(test)]
    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    #[cfg(test)]
    pub fn state(&self) -> EngineState {
        self.state
    }

    fn transition(&mut self, next: EngineState) {
        debug!(from = ?self.state, to = ?next, "Engine transition");
        self.state = next;
    }

    fn md_groups(&self, dimension: &Dimension) -> Vec<Group> {
        if self.config.group_md_by_topology {
            self.replicas.exchange_groups(&dimension.name)
        } else {
            self.replicas.single_groups()
        }
    }

    /// Wave layout of every dimension without submitting anything
    pub fn plan(&self, total_cores: usize) -> Result<Vec<DimensionPlan>, BatchError> {
        self.dimensions
            .iter()
            .map(|dimension| {
                let md_waves = plan_waves(self.md_groups(dimension), dimension.cores, total_cores)?
                    .iter()
                    .map(|wave| wave.replica_count())
                    .collect();
                let exchange_waves = if dimension.kind.is_salt() {
                    plan_waves(
                        self.replicas.exchange_groups(&dimension.name),
                        dimension.replicas(),
                        total_cores,
                    )?
                    .iter()
                    .map(|wave| wave.replica_count())
                    .collect()
                } else {
                    Vec::new()
                };

                Ok(DimensionPlan {
                    name: dimension.name.clone(),
                    md_waves,
                    exchange_waves,
                })
            })
            .collect()
    }

    #[instrument(skip_all, name = "replica_exchange")]
    pub fn execute<G: Gateway>(&mut self, context: &mut ExecutionContext<G>) -> Result<(), EngineError> {
        self.transition(EngineState::StageSharedData);
        context.stage_shared_data()?;

        self.transition(EngineState::WaitResourceActive);
        context.wait_resource_active()?;

        if self.cursor.is_exhausted(self.config.nr_cycles) {
            info!(cycle = self.cursor.cycle, "All cycles already completed, nothing to do");
        }

        while !self.cursor.is_exhausted(self.config.nr_cycles) {
            self.cycle_step(context)?;
        }

        self.transition(EngineState::Terminal);
        info!(
            cycle = self.cursor.cycle,
            dim = self.cursor.dim,
            "Replica exchange finished"
        );

        Ok(())
    }

    fn cycle_step<G: Gateway>(&mut self, context: &mut ExecutionContext<G>) -> Result<(), EngineError> {
        let cursor = self.cursor;
        let tag = cursor.tag();
        let dimension = self.dimensions[cursor.dim].clone();

        info!(
            cycle = cursor.cycle,
            dim = cursor.dim,
            dimension = %dimension.name,
            "Starting cycle step"
        );
        context.recorder().start("cycle_step", &tag);

        self.transition(EngineState::MdWave);
        let groups = self.units(&self.md_groups(&dimension), |replica| {
            self.md_unit(context, cursor, &dimension, replica)
        })?;
        context.run_batched("md", &tag, groups, dimension.cores)?;

        // per replica exchange outputs, indexed by replica id
        let mut columns = Vec::new();
        if dimension.kind.is_salt() {
            self.transition(EngineState::ExchangeWave);
            let template = self
                .config
                .exchange
                .as_ref()
                .ok_or_else(|| ConfigErrors::MissingExchangeKernel(dimension.name.clone()))?;
            let groups = self.replicas.exchange_groups(&dimension.name);
            let ids = groups
                .iter()
                .flat_map(|group| group.replicas.iter().copied())
                .collect_vec();
            let units = self.units(&groups, |replica| {
                self.exchange_unit(context, template, cursor, &dimension, replica)
            })?;
            let outcomes = context.run_batched("exchange", &tag, units, dimension.replicas())?;

            columns = ids
                .into_iter()
                .zip(outcomes)
                .sorted_by_key(|(id, _)| *id)
                .map(|(_, outcome)| outcome.stdout)
                .collect();
        }

        self.transition(EngineState::GlobalExchange);
        let global = self.global_unit(context, cursor, &dimension)?;
        let outcomes = context.run_wave("global_exchange", &tag, vec![global])?;

        self.transition(EngineState::PerformSwap);
        context.recorder().start("swap", &tag);
        self.perform_exchange(&dimension, outcomes.first(), &columns)?;
        context.recorder().end("swap", &tag);
        self.dump(&dimension);

        self.transition(EngineState::Checkpoint);
        context.recorder().start("checkpoint", &tag);
        self.cursor.advance(self.dimensions.len());
        CheckpointRecord::new(self.cursor, self.replicas.as_slice()).store(&self.config.checkpoint)?;
        context.recorder().end("checkpoint", &tag);
        context.recorder().end("cycle_step", &tag);
        context.complete_cycle_step(self.cursor);

        Ok(())
    }

    /// one descriptor per replica, keeping the group structure for batching
    fn units(
        &self,
        groups: &[Group],
        build: impl Fn(&Replica) -> Result<TaskDescriptor, EngineError>,
    ) -> Result<Vec<Vec<TaskDescriptor>>, EngineError> {
        groups
            .iter()
            .map(|group| {
                group
                    .replicas
                    .iter()
                    .map(|&id| build(self.replicas.get(id)?))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect()
    }

    fn vars(&self, cursor: CycleCursor, dimension: &Dimension) -> TemplateVars {
        TemplateVars::from([
            ("cycle".to_owned(), cursor.cycle.to_string()),
            ("dim".to_owned(), cursor.dim.to_string()),
            ("dim_name".to_owned(), dimension.name.clone()),
            ("replicas".to_owned(), self.replicas.len().to_string()),
        ])
    }

    fn replica_vars(&self, cursor: CycleCursor, dimension: &Dimension, replica: &Replica) -> TemplateVars {
        let mut vars = self.vars(cursor, dimension);
        vars.insert("replica".to_owned(), replica.id.to_string());

        for (name, state) in replica.dims.iter() {
            vars.insert(name.clone(), state.par.to_string());

            if *name == dimension.name {
                vars.insert("param".to_owned(), state.par.to_string());
                vars.insert("seq".to_owned(), state.seq.to_string());
            }
        }

        vars
    }

    fn md_unit<G: Gateway>(
        &self,
        context: &ExecutionContext<G>,
        cursor: CycleCursor,
        dimension: &Dimension,
        replica: &Replica,
    ) -> Result<TaskDescriptor, EngineError> {
        let vars = self.replica_vars(cursor, dimension, replica);
        let mut kernel = Kernel::from_template(&self.config.md, &vars);
        kernel.cores = dimension.cores;

        context.bind(format!("md_c{}_r{}", cursor.cycle, replica.id), &kernel)
    }

    fn exchange_unit<G: Gateway>(
        &self,
        context: &ExecutionContext<G>,
        template: &KernelTemplate,
        cursor: CycleCursor,
        dimension: &Dimension,
        replica: &Replica,
    ) -> Result<TaskDescriptor, EngineError> {
        let vars = self.replica_vars(cursor, dimension, replica);
        let mut kernel = Kernel::from_template(template, &vars);
        kernel.cores = dimension.replicas();

        context.bind(format!("ex_c{}_r{}", cursor.cycle, replica.id), &kernel)
    }

    /// single unit computing the swap matrix from the state of all replicas
    fn global_unit<G: Gateway>(
        &self,
        context: &ExecutionContext<G>,
        cursor: CycleCursor,
        dimension: &Dimension,
    ) -> Result<TaskDescriptor, EngineError> {
        let mut vars = self.vars(cursor, dimension);
        vars.insert(
            "params".to_owned(),
            self.replicas
                .iter()
                .filter_map(|replica| replica.dims.get(&dimension.name))
                .map(|state| state.par.to_string())
                .join(","),
        );
        let kernel = Kernel::from_template(&self.config.global_exchange, &vars);

        context.bind(format!("gl_c{}_d{}", cursor.cycle, cursor.dim), &kernel)
    }

    /// Swap the replicas the matrix pairs up. Whatever the global unit printed is used, even
    /// if it failed. Without global output the matrix is assembled from the per replica exchange
    /// outputs, an unreadable matrix means no exchange for this step.
    fn perform_exchange(
        &mut self,
        dimension: &Dimension,
        outcome: Option<&UnitOutcome>,
        columns: &[String],
    ) -> Result<(), EngineError> {
        let stdout = match outcome {
            Some(outcome) => {
                if !outcome.state.is_done() {
                    warn!(
                        unit = %outcome.handle.uid,
                        "Global exchange did not finish, exchanging on whatever it printed"
                    );
                }
                outcome.stdout.as_str()
            }
            None => "",
        };

        let matrix = match SwapMatrix::parse(stdout) {
            Ok(matrix) if matrix.is_empty() && !columns.is_empty() => {
                debug!("Assembling swap matrix from {} exchange outputs", columns.len());
                SwapMatrix::from_columns(columns)
            }
            parsed => parsed,
        };

        match matrix {
            Ok(matrix) if matrix.is_empty() => {
                warn!(dimension = %dimension.name, "Swap matrix is empty, no replicas exchanged");
            }
            Ok(matrix) => {
                let (rows, width) = matrix.dimensions();
                debug!(rows, columns = width, "Read swap matrix");
                let pairs: Vec<(ReplicaId, ReplicaId)> = matrix.exchange_pairs(self.replicas.len());

                for (a, b) in pairs.iter() {
                    self.replicas.perform_swap(*a, *b, &dimension.name)?;
                    debug!(a, b, dimension = %dimension.name, "Exchanged replicas");
                }

                info!(swaps = pairs.len(), dimension = %dimension.name, "Performed exchange");
            }
            Err(error) => {
                warn!(error = ?error, "Failed to read swap matrix, no replicas exchanged: {error}");
            }
        }

        Ok(())
    }

    fn dump(&self, dimension: &Dimension) {
        for replica in self.replicas.iter() {
            if let Some(state) = replica.dims.get(&dimension.name) {
                info!(
                    replica = replica.id,
                    kind = ?state.kind,
                    param = state.par,
                    seq = state.seq,
                    "Replica state"
                );
            }
        }
    }
}
