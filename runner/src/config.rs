use crate::{
    executors::ExecutorError,
    replica::DimensionKind,
    task::TaskDescriptor,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Resource {0} is not defined")]
    UnknownResource(String),
    #[error("Backend {0} not supported")]
    UnsupportedBackend(String),
    #[error("Backend failed to load")]
    FailedLoadBackend(#[from] ExecutorError),
    #[error("Kernel {0} is not defined")]
    UnknownKernel(String),
    #[error("Kernel {kernel} has no configuration for resource {resource} and no '*' fallback")]
    NoKernelConfiguration { kernel: String, resource: String },
    #[error("Dimension {0} exchanges salt but no exchange kernel is configured")]
    MissingExchangeKernel(String),
    #[error("Shared files {first:?} and {second:?} would both be staged as {name}")]
    DuplicateSharedData {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("Pattern {0} has no wave plan")]
    NoWavePlan(&'static str),
    #[error("Configuration failed the preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    // cluster connection parameters, selected by name on the command line
    pub resources: BTreeMap<String, ResourceConfig>,
    #[serde(default)]
    pub backend: BackendConfig,
    // machine specific kernel configuration, keyed by kernel name then resource key
    pub kernels: BTreeMap<String, KernelConfig>,
    // files staged once into the allocation and shared by every unit
    #[serde(default)]
    pub shared_data: Vec<SharedDataConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    pub pattern: PatternConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub cores: usize,
    // walltime in minutes
    pub walltime: u64,
    pub queue: Option<String>,
    pub project: Option<String>,
    #[serde(alias = "access_schema")]
    pub schema: Option<String>,
    // key used to look up kernel machine configs, defaults to the resource name
    pub key: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    // Name of the selected backend, see Executors::load for the selection proccess
    #[serde(default = "default_backend")]
    pub name: String,
    pub workdir: Option<PathBuf>,
    pub threads: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: default_backend(),
            workdir: None,
            threads: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    pub executable: String,
    #[serde(default)]
    pub pre_exec: Vec<String>,
    #[serde(default)]
    pub post_exec: Vec<String>,
    #[serde(default)]
    pub uses_mpi: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    pub machine_configs: BTreeMap<String, MachineConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SharedDataConfig {
    pub path: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    pub glob: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "sink", rename_all = "lowercase", deny_unknown_fields)]
pub enum TelemetryConfig {
    None,
    File { path: PathBuf },
    #[cfg(feature = "sqlite")]
    SQLite { path: PathBuf },
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::File {
            path: default_telemetry_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
/// Unbound kernel invocation, `{name}` placeholders are substituted per unit
pub struct KernelTemplate {
    pub kernel: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_cores")]
    pub cores: usize,
    #[serde(default)]
    pub upload_input_data: Vec<String>,
    #[serde(default)]
    pub link_input_data: Vec<String>,
    #[serde(default)]
    pub copy_input_data: Vec<String>,
    #[serde(default)]
    pub copy_output_data: Vec<String>,
    #[serde(default)]
    pub download_output_data: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternConfig {
    ReplicaExchange(ReplicaExchangeConfig),
    Pipeline(PipelineConfig),
    SimulationAnalysis(SimulationAnalysisConfig),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DimensionConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DimensionKind,
    // parameter ladder, one entry per replica along this dimension
    pub params: Vec<f64>,
    // cores of a single replica's MD run, defaults to `replica_cores`
    pub cores: Option<usize>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ReplicaExchangeConfig {
    pub nr_cycles: usize,
    #[serde(default = "default_cores")]
    pub replica_cores: usize,
    pub dimensions: Vec<DimensionConfig>,
    pub md: KernelTemplate,
    // per replica exchange run, required for salt dimensions
    pub exchange: Option<KernelTemplate>,
    pub global_exchange: KernelTemplate,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint: PathBuf,
    // co-schedule MD runs by exchange group instead of one replica at a time
    #[serde(default)]
    pub group_md_by_topology: bool,
    // seconds to wait for a single wave before canceling the remaining units
    pub wave_timeout: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub instances: usize,
    pub stages: Vec<KernelTemplate>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SimulationAnalysisConfig {
    pub iterations: usize,
    pub simulation_instances: usize,
    pub analysis_instances: usize,
    pub pre_loop: Option<KernelTemplate>,
    pub simulation: KernelTemplate,
    pub analysis: KernelTemplate,
    pub post_loop: Option<KernelTemplate>,
}

impl PatternConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReplicaExchange(_) => "ReplicaExchange",
            Self::Pipeline(_) => "Pipeline",
            Self::SimulationAnalysis(_) => "SimulationAnalysisLoop",
        }
    }

    /// all kernel templates referenced by the pattern
    pub fn templates(&self) -> Vec<(String, &KernelTemplate)> {
        match self {
            Self::ReplicaExchange(config) => {
                let mut templates = vec![
                    ("md".to_owned(), &config.md),
                    ("global_exchange".to_owned(), &config.global_exchange),
                ];
                if let Some(ref exchange) = config.exchange {
                    templates.push(("exchange".to_owned(), exchange));
                }

                templates
            }
            Self::Pipeline(config) => config
                .stages
                .iter()
                .enumerate()
                .map(|(index, stage)| (format!("stages[{index}]"), stage))
                .collect(),
            Self::SimulationAnalysis(config) => {
                let mut templates = Vec::new();
                if let Some(ref pre_loop) = config.pre_loop {
                    templates.push(("pre_loop".to_owned(), pre_loop));
                }
                templates.push(("simulation".to_owned(), &config.simulation));
                templates.push(("analysis".to_owned(), &config.analysis));
                if let Some(ref post_loop) = config.post_loop {
                    templates.push(("post_loop".to_owned(), post_loop));
                }

                templates
            }
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let contents = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn resource(&self, name: &str) -> Result<&ResourceConfig, ConfigErrors> {
        self.resources
            .get(name)
            .ok_or_else(|| ConfigErrors::UnknownResource(name.to_owned()))
    }

    /// validate the whole configuration, returns true if any error was found
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.resources.is_empty() {
            error!("No resource was defined, unable to allocate anything");
            contains_error = true;
        }

        for (name, resource) in self.resources.iter() {
            if resource.cores == 0 {
                error!("resources.{name}.cores cannot be 0");
                contains_error = true;
            }
            if resource.walltime == 0 {
                error!("resources.{name}.walltime cannot be 0");
                contains_error = true;
            }
        }

        self.backend.name = self.backend.name.to_lowercase();
        if self.backend.name != "local" {
            error!(
                "backend.name ({}) is not supported, please use `local` for now",
                self.backend.name
            );
            contains_error = true;
        }
        if self.backend.threads == Some(0) {
            warn!("backend.threads is 0, falling back to the number of cpus");
            self.backend.threads = None;
        }

        for (name, kernel) in self.kernels.iter() {
            if kernel.machine_configs.is_empty() {
                error!("kernels.{name}.machine_configs is empty, the kernel can't be bound to any resource");
                contains_error = true;
            }
        }

        for (index, shared) in self.shared_data.iter_mut().enumerate() {
            if shared.path.is_none() && shared.paths.is_empty() {
                error!("shared_data[{index}] contains neither 'path' nor 'paths'");
                contains_error = true;
            } else if let Some(ref path) = shared.path {
                if !shared.paths.is_empty() {
                    warn!("shared_data[{index}] contains both 'path' and 'paths'. This will be treated as if 'path' is a member of 'paths'");
                }
                // merge path into paths if neccessary
                shared.paths.push(path.clone());
                shared.path = None;
            }
        }

        for (name, template) in self.pattern.templates() {
            if !self.kernels.contains_key(&template.kernel) {
                error!(
                    "pattern.{name}.kernel references {} but it is not defined in kernels",
                    template.kernel
                );
                contains_error = true;
            }
            if template.cores == 0 {
                error!("pattern.{name}.cores cannot be 0");
                contains_error = true;
            }
        }

        match self.pattern {
            PatternConfig::ReplicaExchange(ref config) => {
                if config.nr_cycles == 0 {
                    error!("pattern.nr_cycles cannot be 0");
                    contains_error = true;
                }
                if config.replica_cores == 0 {
                    error!("pattern.replica_cores cannot be 0");
                    contains_error = true;
                }
                if config.dimensions.is_empty() {
                    error!("pattern.dimensions is empty, there is nothing to exchange");
                    contains_error = true;
                }

                let mut names = Vec::new();
                for dimension in config.dimensions.iter() {
                    if names.contains(&dimension.name) {
                        error!("Dimension {} is defined twice", dimension.name);
                        contains_error = true;
                    }
                    names.push(dimension.name.clone());

                    if dimension.params.is_empty() {
                        error!("Dimension {} has no parameters", dimension.name);
                        contains_error = true;
                    }
                    if dimension.cores == Some(0) {
                        error!("Dimension {}.cores cannot be 0", dimension.name);
                        contains_error = true;
                    }
                    if dimension.kind.is_salt() && config.exchange.is_none() {
                        error!(
                            "Dimension {} is a salt dimension but pattern.exchange is not defined",
                            dimension.name
                        );
                        contains_error = true;
                    }
                }
            }
            PatternConfig::Pipeline(ref config) => {
                if config.instances == 0 {
                    error!("pattern.instances cannot be 0");
                    contains_error = true;
                }
                if config.stages.is_empty() {
                    error!("pattern.stages is empty, a pipeline can't be a NOP");
                    contains_error = true;
                }
            }
            PatternConfig::SimulationAnalysis(ref config) => {
                if config.iterations == 0 {
                    error!("pattern.iterations cannot be 0");
                    contains_error = true;
                }
                if config.simulation_instances == 0 || config.analysis_instances == 0 {
                    error!("pattern.simulation_instances and pattern.analysis_instances must be positive");
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

impl KernelConfig {
    /// Machine config for a resource key, falling back to the generic `*` entry
    pub fn resolve(&self, kernel: &str, resource_key: &str) -> Result<&MachineConfig, ConfigErrors> {
        self.machine_configs
            .get(resource_key)
            .or_else(|| self.machine_configs.get(WILDCARD_RESOURCE))
            .ok_or_else(|| ConfigErrors::NoKernelConfiguration {
                kernel: kernel.to_owned(),
                resource: resource_key.to_owned(),
            })
    }
}

impl MachineConfig {
    /// prefill a descriptor with the machine specific parts
    pub fn descriptor(&self, name: String) -> TaskDescriptor {
        TaskDescriptor {
            name,
            pre_exec: self.pre_exec.clone(),
            executable: self.executable.clone(),
            post_exec: self.post_exec.clone(),
            environment: self.environment.clone(),
            uses_mpi: self.uses_mpi,
            ..TaskDescriptor::default()
        }
    }
}

pub const WILDCARD_RESOURCE: &str = "*";

fn default_backend() -> String {
    "local".to_owned()
}

fn default_cores() -> usize {
    1
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("replicas.yaml")
}

fn default_telemetry_path() -> PathBuf {
    PathBuf::from("profile.csv")
}
