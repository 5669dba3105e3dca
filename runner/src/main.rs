mod batching;
mod checkpoint;
mod config;
mod exchange;
mod executors;
mod interrupt;
mod kernel;
mod patterns;
mod replica;
mod shared;
mod stage;
mod task;
mod telemetry;

use clap::{ArgAction, Parser, Subcommand};
use config::{ConfigErrors, PatternConfig, RunConfig};
use executors::Executors;
use kernel::KernelRegistry;
use patterns::{replica_exchange::ReplicaExchange, EngineError, ExecutionContext, Pattern, RunSummary};
use shared::SharedData;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};
use telemetry::{TelemetrySinks, TimingRecorder};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// exit status of a run stopped by SIGINT/SIGTERM
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run ensembles of simulation pipelines and replica exchange cycles")]
struct Cli {
    /// increase verbosity, `-v` for debug and `-vv` for trace output
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// run the configured pattern on a resource
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// name of the resource in the configuration
        #[arg(short, long)]
        resource: String,
        /// resume a replica exchange run from its checkpoint
        #[arg(long)]
        restart: bool,
    },
    /// print the waves every dimension of a replica exchange run submits
    Plan {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        resource: String,
    },
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// load and validate, every problem is reported before failing
fn load_config(path: &Path) -> Result<RunConfig, ConfigErrors> {
    let mut config = RunConfig::load(path)?;

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight);
    }

    Ok(config)
}

fn run(path: &Path, resource_name: &str, restart: bool) -> Result<RunSummary, EngineError> {
    let config = load_config(path)?;
    let resource = config.resource(resource_name)?.clone();
    let registry = KernelRegistry::new(
        config.kernels.clone(),
        resource.key.clone().unwrap_or_else(|| resource_name.to_owned()),
    );

    // configuration errors surface before anything is allocated
    registry.verify(
        config
            .pattern
            .templates()
            .iter()
            .map(|(_, template)| template.kernel.as_str()),
    )?;
    let shared = SharedData::collect(&config.shared_data)?;
    let mut pattern = Pattern::load(&config.pattern, restart)?;

    let interrupt = interrupt::install().unwrap_or_else(|e| {
        warn!("Failed to install signal handlers, interrupts will not be caught: {e}");
        Arc::new(AtomicBool::new(false))
    });
    let sink = TelemetrySinks::load(&config.telemetry).unwrap_or_else(|e| {
        warn!("Failed to open telemetry, timings will not be recorded: {e}");
        TelemetrySinks::Null
    });
    let wave_timeout = match config.pattern {
        PatternConfig::ReplicaExchange(ref pattern) => pattern.wave_timeout.map(Duration::from_secs),
        _ => None,
    };

    let gateway = Executors::load(&config.backend, &resource, interrupt.clone())?;
    info!(
        pattern = config.pattern.name(),
        resource = resource_name,
        cores = resource.cores,
        "Starting run"
    );

    let mut context = ExecutionContext::new(
        gateway,
        registry,
        TimingRecorder::new(sink),
        shared,
        resource.cores,
        interrupt,
    )
    .with_wave_timeout(wave_timeout);
    let result = pattern.execute(&mut context);
    let summary = context.close();
    report(&summary);

    result.map(|_| summary)
}

fn plan(path: &Path, resource_name: &str) -> Result<(), EngineError> {
    let config = load_config(path)?;
    let resource = config.resource(resource_name)?;

    let PatternConfig::ReplicaExchange(ref pattern) = config.pattern else {
        return Err(ConfigErrors::NoWavePlan(config.pattern.name()).into());
    };
    let plan = ReplicaExchange::new(pattern.clone()).plan(resource.cores)?;

    // plain structs of numbers always serialize
    print!("{}", serde_yaml::to_string(&plan).unwrap_or_log());

    Ok(())
}

fn report(summary: &RunSummary) {
    for failed in summary.failed.iter() {
        warn!(
            unit = %failed.uid,
            name = %failed.name,
            phase = %failed.phase,
            tag = %failed.tag,
            state = %failed.state,
            "Failed unit"
        );
    }

    info!(
        units = summary.units,
        waves = summary.waves,
        cycle_steps = summary.cycle_steps,
        failed = summary.failed.len(),
        "Run finished"
    );
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Run {
            config,
            resource,
            restart,
        } => run(&config, &resource, restart).map(|_| ()),
        Command::Plan { config, resource } => plan(&config, &resource),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(EngineError::Interrupted) => {
            error!("Run was interrupted, the last completed checkpoint is kept");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            error!(error = ?e, "{e}");
            ExitCode::FAILURE
        }
    }
}
