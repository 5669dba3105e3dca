use crate::{
    config::{ConfigErrors, KernelConfig, KernelTemplate},
    task::{split_directive, StagingAction, StagingDirective, TaskDescriptor, STAGING_PREFIX},
};
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::debug;

/// Placeholder values available to kernel templates, e.g., `{replica}` or `{cycle}`
pub type TemplateVars = BTreeMap<String, String>;

/// Substitute every `{key}` of `vars` in `input`, unknown placeholders are kept as is
pub fn render(input: &str, vars: &TemplateVars) -> String {
    vars.iter().fold(input.to_owned(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

#[derive(Clone, Debug, Default, PartialEq)]
/// A kernel invocation that is not yet bound to a resource
pub struct Kernel {
    pub name: String,
    pub arguments: Vec<String>,
    pub cores: usize,
    pub upload_input_data: Vec<String>,
    pub link_input_data: Vec<String>,
    pub copy_input_data: Vec<String>,
    pub copy_output_data: Vec<String>,
    pub download_output_data: Vec<String>,
}

impl Kernel {
    #[cfg(test)]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cores: 1,
            ..Self::default()
        }
    }

    pub fn from_template(template: &KernelTemplate, vars: &TemplateVars) -> Self {
        let render_all = |items: &[String]| {
            items
                .iter()
                .map(|item| render(item, vars))
                .collect::<Vec<_>>()
        };

        Self {
            name: template.kernel.clone(),
            arguments: render_all(&template.arguments),
            cores: template.cores,
            upload_input_data: render_all(&template.upload_input_data),
            link_input_data: render_all(&template.link_input_data),
            copy_input_data: render_all(&template.copy_input_data),
            copy_output_data: render_all(&template.copy_output_data),
            download_output_data: render_all(&template.download_output_data),
        }
    }

    /// Substitute unit references such as `$STAGE_1` in the link directives. Longer references
    /// go first so `$STAGE_10` isn't taken for `$STAGE_1`.
    pub fn resolve_links(mut self, references: &BTreeMap<String, String>) -> Self {
        let references = references
            .iter()
            .sorted_by_key(|(reference, _)| std::cmp::Reverse(reference.len()))
            .collect_vec();

        for item in self.link_input_data.iter_mut() {
            for (reference, sandbox) in references.iter() {
                if item.contains(reference.as_str()) {
                    *item = item.replace(reference.as_str(), sandbox);
                }
            }
        }

        self
    }
}

#[derive(Clone, Debug, Default)]
/// Explicit mapping from (kernel, resource key) to machine configuration
pub struct KernelRegistry {
    kernels: BTreeMap<String, KernelConfig>,
    resource_key: String,
}

impl KernelRegistry {
    pub fn new(kernels: BTreeMap<String, KernelConfig>, resource_key: impl Into<String>) -> Self {
        Self {
            kernels,
            resource_key: resource_key.into(),
        }
    }

    /// check that every kernel in `names` can be bound before anything is submitted
    pub fn verify<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<(), ConfigErrors> {
        for name in names {
            self.kernels
                .get(name)
                .ok_or_else(|| ConfigErrors::UnknownKernel(name.to_owned()))?
                .resolve(name, &self.resource_key)?;
        }

        Ok(())
    }

    /// Turn a kernel invocation into a task descriptor for the bound resource.
    ///
    /// Input staging order: uploads, links, the shared data list, copies from the staging area.
    /// Output staging order: downloads, copies into the staging area.
    pub fn bind(
        &self,
        unit_name: String,
        kernel: &Kernel,
        shared: &[StagingDirective],
    ) -> Result<TaskDescriptor, ConfigErrors> {
        let machine = self
            .kernels
            .get(&kernel.name)
            .ok_or_else(|| ConfigErrors::UnknownKernel(kernel.name.clone()))?
            .resolve(&kernel.name, &self.resource_key)?;

        debug!(kernel = %kernel.name, resource = %self.resource_key, unit = %unit_name, "Binding kernel");

        let mut descriptor = machine.descriptor(unit_name);
        descriptor.arguments = kernel.arguments.clone();
        descriptor.cores = kernel.cores.max(1);

        let directives = |items: &[String], action: StagingAction| {
            items
                .iter()
                .map(|item| {
                    let (source, target) = split_directive(item);
                    StagingDirective::new(source, target, action)
                })
                .collect::<Vec<_>>()
        };

        descriptor
            .input_staging
            .extend(directives(&kernel.upload_input_data, StagingAction::Transfer));
        descriptor
            .input_staging
            .extend(directives(&kernel.link_input_data, StagingAction::Link));
        descriptor.input_staging.extend(shared.iter().cloned());
        descriptor.input_staging.extend(
            kernel
                .copy_input_data
                .iter()
                .map(|item| StagingDirective::from_staging_area(item.trim_start_matches(STAGING_PREFIX))),
        );

        descriptor
            .output_staging
            .extend(directives(&kernel.download_output_data, StagingAction::Transfer));
        descriptor.output_staging.extend(
            kernel
                .copy_output_data
                .iter()
                .map(|item| StagingDirective::to_staging_area(item)),
        );

        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    fn registry(resource_key: &str) -> KernelRegistry {
        let mut machine_configs = BTreeMap::new();
        machine_configs.insert(
            "*".to_owned(),
            MachineConfig {
                executable: "python".to_owned(),
                ..MachineConfig::default()
            },
        );
        machine_configs.insert(
            "archer".to_owned(),
            MachineConfig {
                executable: "pmemd.MPI".to_owned(),
                pre_exec: vec!["module load amber".to_owned()],
                uses_mpi: true,
                ..MachineConfig::default()
            },
        );

        KernelRegistry::new(
            BTreeMap::from([("md.amber".to_owned(), KernelConfig { machine_configs })]),
            resource_key,
        )
    }

    #[test]
    fn render_placeholders() {
        let vars = TemplateVars::from([
            ("replica".to_owned(), "3".to_owned()),
            ("cycle".to_owned(), "2".to_owned()),
        ]);

        assert_eq!(render("md_{replica}_{cycle}.in", &vars), "md_3_2.in");
        assert_eq!(render("{unknown}", &vars), "{unknown}");
    }

    #[test]
    fn bind_uses_machine_config() {
        let mut kernel = Kernel::new("md.amber");
        kernel.cores = 4;
        kernel.arguments = vec!["-O".to_owned()];

        let descriptor = registry("archer")
            .bind("md_c1_r0".to_owned(), &kernel, &[])
            .unwrap();

        assert_eq!(descriptor.name, "md_c1_r0");
        assert_eq!(descriptor.executable, "pmemd.MPI");
        assert_eq!(descriptor.pre_exec, vec!["module load amber".to_owned()]);
        assert!(descriptor.uses_mpi);
        assert_eq!(descriptor.cores, 4);
        assert_eq!(descriptor.arguments, vec!["-O".to_owned()]);
    }

    #[test]
    fn bind_falls_back_to_generic_config() {
        let descriptor = registry("stampede")
            .bind("x".to_owned(), &Kernel::new("md.amber"), &[])
            .unwrap();

        assert_eq!(descriptor.executable, "python");
        assert!(!descriptor.uses_mpi);
    }

    #[test]
    fn bind_unknown_kernel() {
        assert!(matches!(
            registry("archer").bind("x".to_owned(), &Kernel::new("misc.ccount"), &[]),
            Err(ConfigErrors::UnknownKernel(_))
        ));
        assert!(registry("archer").verify(["md.amber"]).is_ok());
        assert!(registry("archer").verify(["md.amber", "misc.ccount"]).is_err());
    }

    #[test]
    fn longer_references_win() {
        let mut kernel = Kernel::new("md.amber");
        kernel.link_input_data = vec!["$STAGE_10/out.dat".to_owned(), "$STAGE_1/in.dat".to_owned()];

        let kernel = kernel.resolve_links(&BTreeMap::from([
            ("$STAGE_1".to_owned(), "/a".to_owned()),
            ("$STAGE_10".to_owned(), "/j".to_owned()),
        ]));

        assert_eq!(kernel.link_input_data, vec!["/j/out.dat", "/a/in.dat"]);
    }

    #[test]
    fn staging_order() {
        let mut kernel = Kernel::new("md.amber");
        kernel.upload_input_data = vec!["input.pdb".to_owned()];
        kernel.link_input_data = vec!["$STAGE_1/asciifile.dat".to_owned()];
        kernel.copy_input_data = vec!["restart.rst".to_owned()];
        kernel.copy_output_data = vec!["md.out".to_owned()];
        kernel.download_output_data = vec!["cfreqs.dat > cfreqs-1.dat".to_owned()];

        let kernel = kernel.resolve_links(&BTreeMap::from([(
            "$STAGE_1".to_owned(),
            "/scratch/unit.000001".to_owned(),
        )]));
        let shared = [StagingDirective::from_staging_area("params.prmtop")];
        let descriptor = registry("archer")
            .bind("x".to_owned(), &kernel, &shared)
            .unwrap();

        let inputs = descriptor
            .input_staging
            .iter()
            .map(|d| (d.source.as_str(), d.target.as_str(), d.action))
            .collect::<Vec<_>>();
        assert_eq!(
            inputs,
            vec![
                ("input.pdb", "input.pdb", StagingAction::Transfer),
                ("/scratch/unit.000001/asciifile.dat", "asciifile.dat", StagingAction::Link),
                ("staging:///params.prmtop", "params.prmtop", StagingAction::Copy),
                ("staging:///restart.rst", "restart.rst", StagingAction::Copy),
            ]
        );

        let outputs = descriptor
            .output_staging
            .iter()
            .map(|d| (d.source.as_str(), d.target.as_str(), d.action))
            .collect::<Vec<_>>();
        assert_eq!(
            outputs,
            vec![
                ("cfreqs.dat", "cfreqs-1.dat", StagingAction::Transfer),
                ("md.out", "staging:///md.out", StagingAction::Copy),
            ]
        );
    }
}
