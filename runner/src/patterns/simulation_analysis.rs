use super::{reference, EngineError, ExecutionContext};
use crate::{
    config::{KernelTemplate, SimulationAnalysisConfig},
    executors::Gateway,
    kernel::{Kernel, TemplateVars},
    stage::{Pipeline, Stage, Task},
};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

const PRE_LOOP: &str = "$PRE_LOOP";
const PREV_SIMULATION: &str = "$PREV_SIMULATION";
const PREV_ANALYSIS: &str = "$PREV_ANALYSIS";

#[derive(Debug, Default)]
/// sandboxes of the most recent stages, indexed by instance
struct References {
    pre_loop: Vec<String>,
    simulation: Vec<String>,
    analysis: Vec<String>,
}

impl References {
    fn resolve(&self, instance: usize) -> BTreeMap<String, String> {
        [
            (PRE_LOOP, &self.pre_loop),
            (PREV_SIMULATION, &self.simulation),
            (PREV_ANALYSIS, &self.analysis),
        ]
        .into_iter()
        .filter_map(|(name, sandboxes)| {
            reference(sandboxes, instance).map(|sandbox| (name.to_owned(), sandbox.clone()))
        })
        .collect()
    }
}

#[derive(Debug)]
/// Optional pre loop, `iterations` times simulation followed by analysis, optional post loop
pub struct SimulationAnalysisLoop {
    config: SimulationAnalysisConfig,
    pipeline: Pipeline,
}

impl SimulationAnalysisLoop {
    pub fn new(config: SimulationAnalysisConfig) -> Self {
        Self {
            config,
            pipeline: Pipeline::new("simulation_analysis"),
        }
    }

    #[cfg(test)]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    #[instrument(skip_all, name = "simulation_analysis")]
    pub fn execute<G: Gateway>(&mut self, context: &mut ExecutionContext<G>) -> Result<(), EngineError> {
        context.stage_shared_data()?;
        context.wait_resource_active()?;

        let config = self.config.clone();
        let mut references = References::default();

        if let Some(ref template) = config.pre_loop {
            references.pre_loop =
                self.run(context, "pre_loop", template, 1, 0, &references, |_, _| "pre_loop".to_owned())?;
        }

        for iteration in 1..=config.iterations {
            references.simulation = self.run(
                context,
                "simulation",
                &config.simulation,
                config.simulation_instances,
                iteration,
                &references,
                |iteration, instance| format!("sim_i{iteration}_n{instance}"),
            )?;
            references.analysis = self.run(
                context,
                "analysis",
                &config.analysis,
                config.analysis_instances,
                iteration,
                &references,
                |iteration, instance| format!("ana_i{iteration}_n{instance}"),
            )?;
            info!(iteration, "Iteration finished");
        }

        if let Some(ref template) = config.post_loop {
            self.run(
                context,
                "post_loop",
                template,
                1,
                config.iterations,
                &references,
                |_, _| "post_loop".to_owned(),
            )?;
        }

        info!(
            stages = self.pipeline.stages().len(),
            completed = self.pipeline.completed(),
            "Simulation analysis loop finished"
        );

        Ok(())
    }

    /// Run one stage of `instances` tasks and return their sandboxes
    #[allow(clippy::too_many_arguments)]
    fn run<G: Gateway>(
        &mut self,
        context: &mut ExecutionContext<G>,
        name: &str,
        template: &KernelTemplate,
        instances: usize,
        iteration: usize,
        references: &References,
        unit_name: impl Fn(usize, usize) -> String,
    ) -> Result<Vec<String>, EngineError> {
        let mut stage = Stage::new(name);
        let mut uids = Vec::with_capacity(instances);

        for instance in 1..=instances {
            let vars = TemplateVars::from([
                ("iteration".to_owned(), iteration.to_string()),
                ("instance".to_owned(), instance.to_string()),
            ]);
            let kernel =
                Kernel::from_template(template, &vars).resolve_links(&references.resolve(instance));
            let task = Task::new(context.bind(unit_name(iteration, instance), &kernel)?);

            uids.push(task.uid.clone());
            stage.add_tasks([task]);
        }

        self.pipeline.add_stages([stage]);
        let Some(stage) = self.pipeline.last_stage_mut() else {
            return Ok(Vec::new());
        };
        context.run_stage(stage, &format!("{name}_i{iteration}"), template.cores)?;

        if !stage.check_tasks_status() {
            warn!(stage = name, iteration, "Stage finished with failed tasks, continuing");
        }

        Ok(uids
            .iter()
            .filter_map(|uid| stage.task(uid).and_then(|task| task.sandbox()))
            .map(str::to_owned)
            .collect())
    }
}
