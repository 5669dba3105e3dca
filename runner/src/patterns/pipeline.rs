use super::{reference, EngineError, ExecutionContext};
use crate::{
    config::PipelineConfig,
    executors::Gateway,
    kernel::{Kernel, TemplateVars},
    stage::{Pipeline, Stage, Task},
};
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

#[derive(Debug)]
/// `instances` identical pipelines, stage `n` of every instance runs as one stage
pub struct EnsembleOfPipelines {
    config: PipelineConfig,
    pipeline: Pipeline,
}

impl EnsembleOfPipelines {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            pipeline: Pipeline::new("ensemble"),
        }
    }

    #[cfg(test)]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    #[instrument(skip_all, name = "pipeline")]
    pub fn execute<G: Gateway>(&mut self, context: &mut ExecutionContext<G>) -> Result<(), EngineError> {
        context.stage_shared_data()?;
        context.wait_resource_active()?;

        // sandboxes of every finished stage, indexed by instance
        let mut sandboxes: Vec<Vec<String>> = Vec::new();

        for (index, template) in self.config.stages.iter().enumerate() {
            let number = index + 1;
            let mut stage = Stage::new(format!("stage_{number}"));
            let mut uids = Vec::with_capacity(self.config.instances);

            for instance in 1..=self.config.instances {
                let vars = TemplateVars::from([
                    ("stage".to_owned(), number.to_string()),
                    ("instance".to_owned(), instance.to_string()),
                ]);
                let references = sandboxes
                    .iter()
                    .enumerate()
                    .filter_map(|(previous, stage)| {
                        reference(stage, instance)
                            .map(|sandbox| (format!("$STAGE_{}", previous + 1), sandbox.clone()))
                    })
                    .collect::<BTreeMap<_, _>>();
                let kernel = Kernel::from_template(template, &vars).resolve_links(&references);
                let task = Task::new(context.bind(format!("s{number}_i{instance}"), &kernel)?);

                uids.push(task.uid.clone());
                stage.add_tasks([task]);
            }

            self.pipeline.add_stages([stage]);
            let Some(stage) = self.pipeline.last_stage_mut() else {
                continue;
            };
            context.run_stage(stage, &format!("s{number}"), template.cores)?;

            if !stage.check_tasks_status() {
                let failed = stage
                    .tasks()
                    .filter(|task| !task.state.is_done())
                    .map(Task::name)
                    .join(", ");
                warn!(stage = number, "Stage finished with failed tasks ({failed}), continuing");
            }

            sandboxes.push(
                uids.iter()
                    .filter_map(|uid| stage.task(uid).and_then(|task| task.sandbox()))
                    .map(str::to_owned)
                    .collect(),
            );
        }

        info!(
            stages = self.pipeline.stages().len(),
            completed = self.pipeline.completed(),
            "Pipelines finished"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::KernelTemplate,
        patterns::testing::context,
        task::{StagingAction, UnitState},
    };

    fn config(instances: usize) -> PipelineConfig {
        PipelineConfig {
            instances,
            stages: vec![
                KernelTemplate {
                    kernel: "misc".to_owned(),
                    arguments: vec!["--seed={instance}".to_owned()],
                    cores: 1,
                    download_output_data: vec!["out.dat > out-{instance}.dat".to_owned()],
                    ..KernelTemplate::default()
                },
                KernelTemplate {
                    kernel: "misc".to_owned(),
                    cores: 2,
                    link_input_data: vec!["$STAGE_1/out.dat".to_owned()],
                    ..KernelTemplate::default()
                },
            ],
        }
    }

    #[test]
    fn stages_run_in_order() {
        let mut pattern = EnsembleOfPipelines::new(config(3));
        let (mut context, _) = context(4, |_| (UnitState::Done, String::new()));

        pattern.execute(&mut context).unwrap();

        let gateway = context.gateway();
        // three single core tasks fit, the two core tasks don't
        assert_eq!(gateway.wave_sizes(), vec![3, 2, 1]);
        assert_eq!(gateway.names()[0], vec!["s1_i1", "s1_i2", "s1_i3"]);
        assert_eq!(gateway.waves[0][1].arguments, vec!["--seed=2"]);
        assert_eq!(
            gateway.waves[0][2].output_staging[0].target,
            "out-3.dat"
        );

        // instance 2 of stage 2 links the output of instance 2 of stage 1
        let link = &gateway.waves[1][1].input_staging[0];
        assert_eq!(link.action, StagingAction::Link);
        assert_eq!(link.source, "/sandbox/unit.000002/out.dat");

        assert!(pattern.pipeline().completed());
        assert!(pattern
            .pipeline()
            .stages()
            .iter()
            .all(Stage::check_tasks_status));
    }

    #[test]
    fn failed_stage_continues() {
        let mut pattern = EnsembleOfPipelines::new(config(2));
        let (mut context, _) = context(4, |descriptor| {
            if descriptor.name == "s1_i1" {
                (UnitState::Failed, "bad input".to_owned())
            } else {
                (UnitState::Done, String::new())
            }
        });

        pattern.execute(&mut context).unwrap();

        assert!(!pattern.pipeline().stages()[0].check_tasks_status());
        assert!(pattern.pipeline().stages()[1].check_tasks_status());
        assert_eq!(context.close().failed[0].name, "s1_i1");
    }
}
