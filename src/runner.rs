/// Coverage run pipeline: prepare and instrument the workspace, launch the
/// run command, wait for readiness, stop it, collect the snapshot, and emit
/// the report.
use crate::config::CovConfig;
use crate::coverage::{CoverageAggregate, CoverageSummary};
use crate::instrument::{CommandEngine, InstrumentationEngine};
use crate::launcher::{self, LaunchError, LaunchSpec, ProcessHandle};
use crate::report::{self, CommandRenderer, ReportDescriptor, ReportError, ReportRenderer};
use crate::signals::SignalError;
use crate::watcher::{self, SnapshotWatcher, WatchError};
use crate::workspace::{Workspace, WorkspaceError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// How long the run command gets to exit on its own after the snapshot shows
/// up before it is sent SIGTERM.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Outcome of a successful coverage run.
#[derive(Debug)]
pub struct RunSummary {
    pub pid: u32,
    /// Exit code of the run command (None if killed by signal).
    pub exit_code: Option<i32>,
    pub instrumented_files: usize,
    pub descriptor: ReportDescriptor,
    pub coverage: CoverageSummary,
}

/// Errors that end a coverage run. Exactly one is reported per failed run.
#[derive(Debug)]
pub enum RunError {
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    Workspace(WorkspaceError),
    Launch(LaunchError),
    /// The on-ready command could not be started.
    OnReady {
        command: String,
        source: std::io::Error,
    },
    Signal(SignalError),
    Watch(WatchError),
    Report(ReportError),
    /// Ctrl-C before coverage collection started.
    Cancelled,
    /// A blocking stage panicked or was aborted.
    Task { stage: &'static str, detail: String },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::InvalidPattern { pattern, source } => {
                write!(f, "invalid ready pattern '{pattern}': {source}")
            }
            RunError::Workspace(e) => write!(f, "{e}"),
            RunError::Launch(e) => write!(f, "{e}"),
            RunError::OnReady { command, source } => {
                write!(f, "failed to run on-ready command '{command}': {source}")
            }
            RunError::Signal(e) => write!(f, "{e}"),
            RunError::Watch(e) => write!(f, "{e}"),
            RunError::Report(e) => write!(f, "{e}"),
            RunError::Cancelled => write!(f, "coverage run cancelled"),
            RunError::Task { stage, detail } => write!(f, "{stage} task failed: {detail}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::InvalidPattern { source, .. } => Some(source),
            RunError::Workspace(e) => Some(e),
            RunError::Launch(e) => Some(e),
            RunError::OnReady { source, .. } => Some(source),
            RunError::Signal(e) => Some(e),
            RunError::Watch(e) => Some(e),
            RunError::Report(e) => Some(e),
            RunError::Cancelled | RunError::Task { .. } => None,
        }
    }
}

impl From<WorkspaceError> for RunError {
    fn from(e: WorkspaceError) -> Self {
        RunError::Workspace(e)
    }
}

impl From<LaunchError> for RunError {
    fn from(e: LaunchError) -> Self {
        RunError::Launch(e)
    }
}

impl From<SignalError> for RunError {
    fn from(e: SignalError) -> Self {
        RunError::Signal(e)
    }
}

impl From<WatchError> for RunError {
    fn from(e: WatchError) -> Self {
        RunError::Watch(e)
    }
}

impl From<ReportError> for RunError {
    fn from(e: ReportError) -> Self {
        RunError::Report(e)
    }
}

fn task_error(stage: &'static str) -> impl FnOnce(tokio::task::JoinError) -> RunError {
    move |e| RunError::Task {
        stage,
        detail: e.to_string(),
    }
}

/// Replace `{tmp_dir}` and `{project_dir}` in the run command's arguments.
fn build_run_args(args: &[String], workspace: &Workspace) -> Vec<String> {
    let tmp_dir = workspace.tmp_root().to_string_lossy();
    let project_dir = workspace.project_dir().to_string_lossy();
    args.iter()
        .map(|arg| {
            arg.replace("{tmp_dir}", &tmp_dir)
                .replace("{project_dir}", &project_dir)
        })
        .collect()
}

/// One coverage run, assembled from config.
pub struct Runner {
    workspace: Workspace,
    include: Vec<String>,
    launch: LaunchSpec,
    on_ready: Vec<String>,
    watcher: SnapshotWatcher,
    descriptor: ReportDescriptor,
    engine: Arc<dyn InstrumentationEngine>,
    renderer: Arc<dyn ReportRenderer>,
}

impl Runner {
    /// Build a runner using the external instrument and report commands from
    /// config.
    pub fn from_config(config: &CovConfig, descriptor: ReportDescriptor) -> Result<Self, RunError> {
        let workspace = Workspace::new(&config.workspace);
        let ready_pattern =
            Regex::new(&config.run.ready_pattern).map_err(|e| RunError::InvalidPattern {
                pattern: config.run.ready_pattern.clone(),
                source: e,
            })?;
        let launch = LaunchSpec {
            command: config.run.command.clone(),
            args: build_run_args(&config.run.args, &workspace),
            ready_pattern,
            pid_file: Some(workspace.pid_file()),
            working_dir: Some(workspace.project_dir().to_path_buf()),
        };
        let watcher = SnapshotWatcher::new(
            config.watch.poll_interval(),
            config.watch.max_poll_interval(),
            config.watch.timeout(),
        );

        Ok(Self {
            workspace,
            include: config.instrument.include.clone(),
            launch,
            on_ready: config.run.on_ready.clone(),
            watcher,
            descriptor,
            engine: Arc::new(CommandEngine::new(
                config.instrument.command.clone(),
                config.instrument.args.clone(),
            )),
            renderer: Arc::new(CommandRenderer::new(
                config.report.command.clone(),
                config.report.args.clone(),
            )),
        })
    }

    pub fn with_engine(mut self, engine: Arc<dyn InstrumentationEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ReportRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Run the whole pipeline once.
    pub async fn run(self) -> Result<RunSummary, RunError> {
        let workspace = self.workspace.clone();
        let engine = self.engine.clone();
        let include = self.include.clone();
        let instrumented_files = tokio::task::spawn_blocking(move || {
            workspace.prepare()?;
            let count = workspace.instrument_sources(engine.as_ref(), &include)?;
            workspace.inject_capture()?;
            Ok::<_, WorkspaceError>(count)
        })
        .await
        .map_err(task_error("instrumentation"))??;

        let mut handle = launcher::launch(self.launch.clone())?;
        let pid = handle.pid();

        let aggregate = match self.collect(&mut handle).await {
            Ok(aggregate) => aggregate,
            Err(e) => {
                shut_down(handle, &self.workspace.pid_file()).await;
                return Err(e);
            }
        };
        if aggregate.is_empty() {
            tracing::warn!(
                instrumented_files,
                "snapshot holds no coverage data; check the instrument include patterns"
            );
        }

        let exit_code = wait_for_exit(handle).await;
        remove_pid_file(&self.workspace.pid_file());

        let coverage = aggregate.summary();
        tracing::info!(%coverage, "coverage collected");

        let descriptor = self.descriptor.clone();
        let renderer = self.renderer.clone();
        tokio::task::spawn_blocking(move || {
            report::emit(&aggregate, &descriptor, renderer.as_ref())
        })
        .await
        .map_err(task_error("report"))??;

        Ok(RunSummary {
            pid,
            exit_code,
            instrumented_files,
            descriptor: self.descriptor,
            coverage,
        })
    }

    /// Wait for readiness, let the on-ready step finish, then SIGINT the run
    /// command and pick up the snapshot it writes.
    async fn collect(&self, handle: &mut ProcessHandle) -> Result<CoverageAggregate, RunError> {
        let ready = tokio::select! {
            r = handle.wait_ready() => Some(r),
            _ = tokio::signal::ctrl_c() => None,
        };
        match ready {
            Some(r) => r?,
            None => {
                tracing::warn!("interrupted before the run command became ready");
                return Err(RunError::Cancelled);
            }
        }

        self.after_ready().await?;

        // Coverage is only flushed after SIGINT; polling must not start
        // before it has been sent.
        handle.interrupt()?;

        let snapshot = self.watcher.await_snapshot(&self.workspace.snapshot()).await?;
        let mut aggregate = CoverageAggregate::new();
        aggregate.merge(snapshot);
        Ok(aggregate)
    }

    /// Run the on-ready command, or wait for Ctrl-C when there is none.
    async fn after_ready(&self) -> Result<(), RunError> {
        let Some((command, args)) = self.on_ready.split_first() else {
            tracing::info!("run command is ready; press Ctrl-C to stop it and collect coverage");
            return tokio::signal::ctrl_c().await.map_err(|e| RunError::OnReady {
                command: "ctrl-c handler".to_string(),
                source: e,
            });
        };

        tracing::info!(command = %command, args = ?args, "running on-ready command");
        let mut child = Command::new(command)
            .args(args)
            .current_dir(self.workspace.project_dir())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunError::OnReady {
                command: command.clone(),
                source: e,
            })?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| RunError::OnReady {
                    command: command.clone(),
                    source: e,
                })?;
                if status.success() {
                    tracing::info!("on-ready command finished");
                } else {
                    // Coverage is still worth collecting from a failing test run.
                    tracing::warn!(exit_code = ?status.code(), "on-ready command failed");
                }
                Ok(())
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted while the on-ready command was running");
                Err(RunError::Cancelled)
            }
        }
    }
}

/// Hard stop after a failed run: SIGTERM the group, reap the child, and drop
/// the pid sidecar so a later `stop` cannot signal a recycled pid.
async fn shut_down(handle: ProcessHandle, pid_file: &Path) {
    if let Err(e) = handle.terminate() {
        tracing::debug!(error = %e, "run command already gone");
    }
    let pid = handle.pid();
    match tokio::time::timeout(EXIT_GRACE, handle.wait()).await {
        Ok(Ok(code)) => tracing::debug!(pid, exit_code = ?code, "run command reaped"),
        Ok(Err(e)) => tracing::warn!(pid, error = %e, "failed to wait for run command"),
        Err(_) => tracing::warn!(pid, "run command did not exit after SIGTERM"),
    }
    remove_pid_file(pid_file);
}

async fn wait_for_exit(handle: ProcessHandle) -> Option<i32> {
    let pid = handle.pid();
    let wait = handle.wait();
    tokio::pin!(wait);
    match tokio::time::timeout(EXIT_GRACE, &mut wait).await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to wait for run command");
            None
        }
        Err(_) => {
            tracing::warn!(pid, "run command still alive after snapshot, terminating");
            if let Err(e) = crate::signals::terminate(pid) {
                tracing::debug!(error = %e, "run command already gone");
            }
            wait.await.unwrap_or(None)
        }
    }
}

fn remove_pid_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove pid file"),
    }
}

/// Merge existing snapshot files and emit a single report from them.
pub async fn report_snapshots(
    paths: &[PathBuf],
    descriptor: &ReportDescriptor,
    renderer: Arc<dyn ReportRenderer>,
) -> Result<CoverageSummary, RunError> {
    let mut aggregate = CoverageAggregate::new();
    for path in paths {
        aggregate.merge(watcher::read_snapshot(path).await?);
    }
    let coverage = aggregate.summary();
    tracing::info!(
        snapshots = aggregate.snapshot_count(),
        files = aggregate.file_count(),
        %coverage,
        "merged snapshots"
    );

    let descriptor = descriptor.clone();
    tokio::task::spawn_blocking(move || report::emit(&aggregate, &descriptor, renderer.as_ref()))
        .await
        .map_err(task_error("report"))??;
    Ok(coverage)
}
