/// Process launcher: spawn the run command, stream its output, and resolve a
/// readiness future the first time a stdout line matches the ready pattern.
use crate::signals::{self, SignalError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long stdout already written by an exited run command may take to be
/// read before readiness is decided. Background children that inherited the
/// pipe can keep it open indefinitely, so EOF is not waited for.
const STDOUT_DRAIN: Duration = Duration::from_millis(250);

/// Readiness verdict: `Err` carries the exit code of a process that ended
/// before matching.
type ReadyOutcome = Result<(), Option<i32>>;
type ReadySender = Arc<Mutex<Option<oneshot::Sender<ReadyOutcome>>>>;

/// What to launch and how to recognise that it has finished starting.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub ready_pattern: Regex,
    /// Where to record the child's pid for out-of-band termination.
    pub pid_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

/// Errors that can occur while launching or monitoring the run command.
#[derive(Debug)]
pub enum LaunchError {
    /// The command could not be started at all.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The process ended without ever printing a line matching the pattern.
    ExitedBeforeReady {
        command: String,
        exit_code: Option<i32>,
    },
    /// Failed to read output from or wait on the child.
    Io {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn { command, source } => {
                write!(f, "failed to spawn '{command}': {source}")
            }
            LaunchError::ExitedBeforeReady { command, exit_code } => match exit_code {
                Some(code) => write!(
                    f,
                    "'{command}' exited with code {code} before printing the ready pattern"
                ),
                None => write!(
                    f,
                    "'{command}' was killed by a signal before printing the ready pattern"
                ),
            },
            LaunchError::Io { command, source } => {
                write!(f, "I/O error while monitoring '{command}': {source}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::ExitedBeforeReady { .. } => None,
            LaunchError::Io { source, .. } => Some(source),
        }
    }
}

/// Splits a byte stream into lines, holding back any trailing partial line
/// until its newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush the unterminated remainder at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Matches trimmed lines against the ready pattern and reports the first hit
/// only.
#[derive(Debug)]
pub struct ReadyDetector {
    pattern: Regex,
    fired: bool,
}

impl ReadyDetector {
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            fired: false,
        }
    }

    /// Returns `true` exactly once: for the first line that matches.
    pub fn check(&mut self, line: &str) -> bool {
        if self.fired || !self.pattern.is_match(line.trim()) {
            return false;
        }
        self.fired = true;
        true
    }

    #[allow(dead_code)]
    pub fn fired(&self) -> bool {
        self.fired
    }
}

/// Handle to a launched process.
///
/// Readiness and exit are delivered through futures. Once the process has
/// been terminated no further output is processed, and a readiness result
/// that was still pending resolves to `ExitedBeforeReady`.
pub struct ProcessHandle {
    pid: u32,
    command: String,
    ready: Option<oneshot::Receiver<ReadyOutcome>>,
    outcome: Option<ReadyOutcome>,
    monitor: JoinHandle<Result<Option<i32>, LaunchError>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait until the ready pattern matches or the process exits first.
    ///
    /// The verdict is kept: later calls return the same result. There is no
    /// built-in timeout: wrap in `tokio::time::timeout` to impose one.
    pub async fn wait_ready(&mut self) -> Result<(), LaunchError> {
        if let Some(rx) = self.ready.as_mut() {
            // A dropped sender means the monitor task itself was aborted.
            let outcome = rx.await.unwrap_or(Err(None));
            self.ready = None;
            self.outcome = Some(outcome);
        }
        let outcome = self.outcome.unwrap_or(Err(None));
        outcome.map_err(|exit_code| LaunchError::ExitedBeforeReady {
            command: self.command.clone(),
            exit_code,
        })
    }

    /// Ask the process group to shut down and flush coverage (SIGINT).
    pub fn interrupt(&self) -> Result<(), SignalError> {
        tracing::info!(pid = self.pid, "sending SIGINT to run command");
        signals::interrupt(self.pid)
    }

    /// Hard stop for the process group (SIGTERM).
    pub fn terminate(&self) -> Result<(), SignalError> {
        tracing::info!(pid = self.pid, "sending SIGTERM to run command");
        signals::terminate(self.pid)
    }

    /// Wait for the process to exit; returns its exit code (None if killed by
    /// a signal).
    pub async fn wait(self) -> Result<Option<i32>, LaunchError> {
        match self.monitor.await {
            Ok(result) => result,
            Err(e) => Err(LaunchError::Io {
                command: self.command,
                source: std::io::Error::other(e),
            }),
        }
    }
}

/// Record the child's pid for an external terminator. Failure is logged and
/// otherwise ignored.
fn write_pid_file(path: &Path, pid: u32) {
    match std::fs::write(path, pid.to_string()) {
        Ok(()) => tracing::debug!(pid, path = %path.display(), "wrote pid file"),
        Err(e) => tracing::warn!(
            pid,
            path = %path.display(),
            error = %e,
            "failed to write pid file"
        ),
    }
}

/// Spawn the command and start monitoring its output.
///
/// Spawn errors are returned immediately. The child runs as the leader of a
/// new process group so signals reach everything it starts.
pub fn launch(spec: LaunchSpec) -> Result<ProcessHandle, LaunchError> {
    tracing::info!(
        command = %spec.command,
        args = ?spec.args,
        ready_pattern = %spec.ready_pattern,
        "spawning run command"
    );

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0); // New process group for clean signalling
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
        command: spec.command.clone(),
        source: e,
    })?;

    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, "run command started");
    if let Some(path) = &spec.pid_file {
        write_pid_file(path, pid);
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    if let Some(stderr) = stderr {
        tokio::spawn(forward_stderr(stderr));
    }

    let (ready_tx, ready_rx) = oneshot::channel();
    let ready_tx: ReadySender = Arc::new(Mutex::new(Some(ready_tx)));
    let command = spec.command.clone();
    let detector = ReadyDetector::new(spec.ready_pattern);

    let reader = stdout.map(|stdout| {
        let ready_tx = Arc::clone(&ready_tx);
        tokio::spawn(async move {
            if let Err(e) = watch_stdout(stdout, detector, &ready_tx).await {
                tracing::warn!(error = %e, "error reading run command stdout");
            }
        })
    });

    let monitor = tokio::spawn(async move {
        let status = child.wait().await.map_err(|e| LaunchError::Io {
            command: command.clone(),
            source: e,
        })?;
        let exit_code = status.code();
        tracing::info!(exit_code = ?exit_code, "run command exited");

        // Give the reader a moment to see output the process wrote before
        // exiting. If the pipe is still held open it keeps echoing output in
        // the background.
        if let Some(reader) = reader {
            if tokio::time::timeout(STDOUT_DRAIN, reader).await.is_err() {
                tracing::debug!("stdout still open after exit, not waiting for EOF");
            }
        }

        send_ready(&ready_tx, Err(exit_code));
        Ok::<_, LaunchError>(exit_code)
    });

    Ok(ProcessHandle {
        pid,
        command: spec.command,
        ready: Some(ready_rx),
        outcome: None,
        monitor,
    })
}

/// Deliver the readiness verdict unless one was already sent.
fn send_ready(ready_tx: &ReadySender, outcome: ReadyOutcome) {
    let sender = match ready_tx.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(tx) = sender {
        let _ = tx.send(outcome);
    }
}

/// Read stdout in raw chunks until EOF, echoing each line and signalling
/// readiness on the first match.
async fn watch_stdout<R: AsyncRead + Unpin>(
    mut stdout: R,
    mut detector: ReadyDetector,
    ready_tx: &ReadySender,
) -> std::io::Result<()> {
    let mut lines = LineBuffer::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = stdout.read(&mut buf).await?;
        let completed = if n == 0 {
            lines.finish().into_iter().collect()
        } else {
            lines.push(&buf[..n])
        };
        for line in completed {
            tracing::info!(target: "covwatch::child", "{line}");
            if detector.check(&line) {
                tracing::info!(line = %line.trim(), "ready pattern matched");
                send_ready(ready_tx, Ok(()));
            }
        }
        if n == 0 {
            return Ok(());
        }
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::warn!(target: "covwatch::child", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "error reading run command stderr");
                break;
            }
        }
    }
}
