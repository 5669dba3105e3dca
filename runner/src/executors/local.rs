use super::{ExecutorError, Gateway, ResourceState};
use crate::{
    config::{BackendConfig, ResourceConfig},
    task::{
        StagingAction, StagingDirective, TaskDescriptor, UnitHandle, UnitOutcome, UnitState,
        STAGING_PREFIX,
    },
};
use itertools::Itertools;
use parking_lot::FairMutex;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    collections::BTreeMap,
    env,
    fs::{self, File},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, trace, warn};
use wait_timeout::ChildExt;

const STDOUT: &str = "STDOUT";
const STDERR: &str = "STDERR";
const STAGING_AREA: &str = "staging_area";
/// how often a waiting unit looks at the interrupt flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// primitve way to retrieve the tmp dir from the environment with defualt to /tmp
fn get_tmp_dir() -> PathBuf {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or(PathBuf::from("/tmp"))
}

/// quote a word for `sh` unless it only contains safe characters
fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ExecutorError + '_ {
    move |source| ExecutorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug)]
/// Directory layout of the local allocation
struct Layout {
    workdir: PathBuf,
    staging_area: PathBuf,
    client_dir: PathBuf,
    // units of a wave finish concurrently, writes into the staging area are serialized
    staging_lock: FairMutex<()>,
}

impl Layout {
    /// `staging:///x` lives in the staging area, relative paths below `base`
    fn resolve(&self, location: &str, base: &Path) -> PathBuf {
        match location.strip_prefix(STAGING_PREFIX) {
            Some(name) => self.staging_area.join(name),
            None => base.join(location),
        }
    }

    fn stage(&self, directive: &StagingDirective, source_base: &Path, target_base: &Path) -> Result<(), ExecutorError> {
        let source = self.resolve(&directive.source, source_base);
        let target = self.resolve(&directive.target, target_base);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        trace!(source = ?source, target = ?target, action = ?directive.action, "Staging");

        match directive.action {
            StagingAction::Transfer | StagingAction::Copy => {
                fs::copy(&source, &target).map_err(io_error(&source))?;
            }
            StagingAction::Link => {
                if target.symlink_metadata().is_ok() {
                    fs::remove_file(&target).map_err(io_error(&target))?;
                }
                std::os::unix::fs::symlink(&source, &target).map_err(io_error(&source))?;
            }
        }

        Ok(())
    }

    /// input data is pulled from the client (transfers) or the allocation into the sandbox
    fn stage_input(&self, directive: &StagingDirective, sandbox: &Path) -> Result<(), ExecutorError> {
        let source_base = match directive.action {
            StagingAction::Transfer => &self.client_dir,
            _ => &self.workdir,
        };

        self.stage(directive, source_base, sandbox)
    }

    /// output data is pushed from the sandbox to the client (transfers) or the allocation
    fn stage_output(&self, directive: &StagingDirective, sandbox: &Path) -> Result<(), ExecutorError> {
        let target_base = match directive.action {
            StagingAction::Transfer => &self.client_dir,
            _ => &self.workdir,
        };

        if directive.target.starts_with(STAGING_PREFIX) {
            let _guard = self.staging_lock.lock();
            self.stage(directive, sandbox, target_base)
        } else {
            self.stage(directive, sandbox, target_base)
        }
    }
}

#[derive(Debug)]
struct RunningUnit {
    handle: UnitHandle,
    sandbox: PathBuf,
    output_staging: Vec<StagingDirective>,
    child: Option<Child>,
    started: Instant,
    errors: Vec<String>,
}

impl RunningUnit {
    /// Wait in slices until the child exits. A raised interrupt flag or a passed deadline
    /// kills it, `None` is returned in that case.
    fn wait_child(
        &mut self,
        child: &mut Child,
        deadline: Option<Instant>,
        interrupt: &AtomicBool,
    ) -> std::io::Result<Option<ExitStatus>> {
        loop {
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };

            if let Some(status) = child.wait_timeout(slice)? {
                return Ok(Some(status));
            }

            if interrupt.load(Ordering::SeqCst) {
                warn!(unit = %self.handle.uid, "Interrupted, canceling unit");
                break;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(unit = %self.handle.uid, "Unit ran into timeout, canceling");
                break;
            }
        }

        if let Err(e) = child.kill().and_then(|_| child.wait()) {
            self.errors.push(format!("failed to cancel: {e}"));
        }

        Ok(None)
    }

    fn finish(
        mut self,
        deadline: Option<Instant>,
        interrupt: &AtomicBool,
        layout: &Layout,
    ) -> UnitOutcome {
        let mut state = match self.child.take() {
            None => UnitState::Failed,
            Some(mut child) => match self.wait_child(&mut child, deadline, interrupt) {
                Ok(Some(status)) if status.success() => UnitState::Done,
                Ok(Some(status)) => {
                    debug!(unit = %self.handle.uid, "Unit exited with {status}");
                    UnitState::Failed
                }
                Ok(None) => UnitState::Canceled,
                Err(e) => {
                    self.errors.push(format!("failed to wait: {e}"));
                    UnitState::Failed
                }
            },
        };

        let stdout = fs::read_to_string(self.sandbox.join(STDOUT)).unwrap_or_default();
        let mut stderr = fs::read_to_string(self.sandbox.join(STDERR)).unwrap_or_default();

        if state.is_done() {
            for directive in self.output_staging.iter() {
                if let Err(e) = layout.stage_output(directive, &self.sandbox) {
                    self.errors.push(format!("output staging failed: {e}"));
                    state = UnitState::Failed;
                }
            }
        }

        for message in self.errors.iter() {
            stderr.push_str(message);
            stderr.push('\n');
        }

        UnitOutcome {
            handle: self.handle,
            state,
            stdout,
            stderr,
            runtime: self.started.elapsed(),
        }
    }
}

#[derive(Debug)]
/// Backend running units as processes on the local machine, every unit in its own sandbox
/// below the work directory
pub struct LocalExecutor {
    layout: Layout,
    cores: usize,
    pool: ThreadPool,
    running: BTreeMap<String, RunningUnit>,
    counter: u64,
    state: ResourceState,
    // raised by SIGINT/SIGTERM, cancels the running wave
    interrupt: Arc<AtomicBool>,
}

impl LocalExecutor {
    /// create a new LocalExecutor instance
    pub fn load(
        backend: &BackendConfig,
        resource: &ResourceConfig,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self, ExecutorError> {
        let client_dir = env::current_dir().map_err(io_error(Path::new(".")))?;
        let workdir = match backend.workdir {
            Some(ref workdir) => client_dir.join(workdir),
            None => get_tmp_dir().join(format!("ensemble-runner.{}", std::process::id())),
        };
        let staging_area = workdir.join(STAGING_AREA);
        fs::create_dir_all(&staging_area).map_err(io_error(&staging_area))?;

        let threads = backend.threads.unwrap_or_else(num_cpus::get);
        debug!("Starting thread pool with {threads} threads");
        let pool = ThreadPoolBuilder::new().num_threads(threads).build()?;

        info!(
            workdir = ?workdir,
            cores = resource.cores,
            walltime = resource.walltime,
            "Allocated local resource"
        );

        Ok(Self {
            layout: Layout {
                workdir,
                staging_area,
                client_dir,
                staging_lock: FairMutex::new(()),
            },
            cores: resource.cores,
            pool,
            running: BTreeMap::new(),
            counter: 0,
            state: ResourceState::Pending,
            interrupt,
        })
    }

    fn script(descriptor: &TaskDescriptor) -> String {
        let mut command = Vec::new();

        if descriptor.uses_mpi {
            command.push("mpirun".to_owned());
            command.push("-np".to_owned());
            command.push(descriptor.cores.to_string());
        }
        command.push(shell_quote(&descriptor.executable));
        command.extend(descriptor.arguments.iter().map(|arg| shell_quote(arg)));

        let mut lines = descriptor.pre_exec.clone();
        lines.push(command.join(" "));
        lines.push("RETVAL=$?".to_owned());
        lines.extend(descriptor.post_exec.iter().cloned());
        lines.push("exit $RETVAL".to_owned());

        lines.join("\n")
    }

    fn spawn(&self, descriptor: &TaskDescriptor, sandbox: &Path) -> Result<Child, ExecutorError> {
        for directive in descriptor.input_staging.iter() {
            self.layout.stage_input(directive, sandbox)?;
        }

        let stdout_path = sandbox.join(STDOUT);
        let stderr_path = sandbox.join(STDERR);
        let stdout = File::create(&stdout_path).map_err(io_error(&stdout_path))?;
        let stderr = File::create(&stderr_path).map_err(io_error(&stderr_path))?;

        Command::new("/bin/sh")
            .arg("-c")
            .arg(Self::script(descriptor))
            .current_dir(sandbox)
            .envs(descriptor.environment.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(io_error(sandbox))
    }
}

impl Gateway for LocalExecutor {
    fn stage_in(&mut self, directive: &StagingDirective) -> Result<(), ExecutorError> {
        debug!(source = %directive.source, target = %directive.target, "Staging into allocation");

        self.layout
            .stage(directive, &self.layout.client_dir, &self.layout.workdir)
    }

    fn wait_resource_active(&mut self, target: ResourceState) -> Result<(), ExecutorError> {
        match (self.state, target) {
            (current, target) if current == target => Ok(()),
            (ResourceState::Pending, ResourceState::Active) => {
                debug!(threads = self.pool.current_num_threads(), "Local resource is active");
                self.state = ResourceState::Active;
                Ok(())
            }
            (current, _) => Err(ExecutorError::Inactive(current)),
        }
    }

    #[instrument(skip_all, level = "debug", fields(units = wave.len()))]
    fn submit(&mut self, wave: Vec<TaskDescriptor>) -> Result<Vec<UnitHandle>, ExecutorError> {
        if self.state != ResourceState::Active {
            return Err(ExecutorError::Inactive(self.state));
        }

        let demand = wave.iter().map(|descriptor| descriptor.cores).sum::<usize>();
        if demand > self.cores {
            warn!("Wave needs {demand} cores but only {} are allocated, oversubscribing", self.cores);
        }

        let mut handles = Vec::with_capacity(wave.len());

        for descriptor in wave {
            self.counter += 1;
            let uid = format!("unit.{:06}", self.counter);
            let sandbox = self.layout.workdir.join(&uid);
            fs::create_dir_all(&sandbox).map_err(io_error(&sandbox))?;

            let handle = UnitHandle {
                uid: uid.clone(),
                name: descriptor.name.clone(),
                sandbox: sandbox.to_string_lossy().into_owned(),
            };
            let mut errors = Vec::new();
            let child = match self.spawn(&descriptor, &sandbox) {
                Ok(child) => Some(child),
                Err(e) => {
                    error!(unit = %uid, name = %descriptor.name, "Failed to start unit: {e}");
                    errors.push(e.to_string());
                    None
                }
            };

            debug!(unit = %uid, name = %descriptor.name, "Submitted unit");

            self.running.insert(
                uid,
                RunningUnit {
                    handle: handle.clone(),
                    sandbox,
                    output_staging: descriptor.output_staging,
                    child,
                    started: Instant::now(),
                    errors,
                },
            );
            handles.push(handle);
        }

        Ok(handles)
    }

    #[instrument(skip_all, level = "debug", fields(units = handles.len()))]
    fn wait(
        &mut self,
        handles: &[UnitHandle],
        timeout: Option<Duration>,
    ) -> Result<Vec<UnitOutcome>, ExecutorError> {
        if let Some(missing) = handles
            .iter()
            .find(|handle| !self.running.contains_key(&handle.uid))
        {
            return Err(ExecutorError::UnknownUnit(missing.uid.clone()));
        }

        let units = handles
            .iter()
            .filter_map(|handle| self.running.remove(&handle.uid))
            .collect_vec();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let layout = &self.layout;
        let interrupt = self.interrupt.as_ref();

        let outcomes = self.pool.install(|| {
            units
                .into_par_iter()
                .map(|unit| unit.finish(deadline, interrupt, layout))
                .collect::<Vec<_>>()
        });

        debug!(
            done = outcomes.iter().filter(|outcome| outcome.state.is_done()).count(),
            "Wave finished"
        );

        Ok(outcomes)
    }

    fn deallocate(&mut self) -> Result<(), ExecutorError> {
        if self.state == ResourceState::Done {
            return Ok(());
        }

        for (uid, mut unit) in std::mem::take(&mut self.running) {
            if let Some(mut child) = unit.child.take() {
                warn!(unit = %uid, "Canceling unit on deallocation");
                if let Err(e) = child.kill().and_then(|_| child.wait()) {
                    error!(unit = %uid, "Failed to cancel unit: {e}");
                }
            }
        }

        self.state = ResourceState::Done;
        info!(workdir = ?self.layout.workdir, "Deallocated local resource");

        Ok(())
    }
}
