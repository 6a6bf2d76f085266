/// Signal delivery to the monitored process group.
///
/// The run command is spawned as the leader of its own process group, so its
/// pid doubles as the group id. SIGINT asks the instrumented app to flush its
/// coverage counters; SIGTERM is the hard stop used when a run is abandoned.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Errors from signalling a process group or reading the pid sidecar.
#[derive(Debug)]
pub enum SignalError {
    /// Failed to read the pid sidecar file.
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The pid sidecar did not contain a positive integer.
    InvalidPid { path: PathBuf, contents: String },
    /// The kernel refused the signal (no such group, permission denied).
    Send {
        pid: u32,
        signal: Signal,
        source: nix::Error,
    },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::PidFile { path, source } => {
                write!(f, "failed to read pid file {}: {}", path.display(), source)
            }
            SignalError::InvalidPid { path, contents } => {
                write!(
                    f,
                    "pid file {} does not contain a pid: {:?}",
                    path.display(),
                    contents
                )
            }
            SignalError::Send {
                pid,
                signal,
                source,
            } => {
                write!(f, "failed to send {signal} to process group {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::PidFile { source, .. } => Some(source),
            SignalError::InvalidPid { .. } => None,
            SignalError::Send { source, .. } => Some(source),
        }
    }
}

/// Send SIGINT to the process group led by `pid`.
pub fn interrupt(pid: u32) -> Result<(), SignalError> {
    send(pid, Signal::SIGINT)
}

/// Send SIGTERM to the process group led by `pid`.
pub fn terminate(pid: u32) -> Result<(), SignalError> {
    send(pid, Signal::SIGTERM)
}

fn send(pid: u32, signal: Signal) -> Result<(), SignalError> {
    // killpg(0) would signal our own group.
    let raw = i32::try_from(pid)
        .ok()
        .filter(|&p| p > 0)
        .ok_or(SignalError::Send {
            pid,
            signal,
            source: nix::Error::EINVAL,
        })?;
    tracing::debug!(pid, %signal, "signalling process group");
    killpg(Pid::from_raw(raw), signal).map_err(|e| SignalError::Send {
        pid,
        signal,
        source: e,
    })
}

/// Parse the pid written by the launcher into its sidecar file.
pub fn read_pid_file(path: &Path) -> Result<u32, SignalError> {
    let contents = std::fs::read_to_string(path).map_err(|e| SignalError::PidFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    match contents.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(SignalError::InvalidPid {
            path: path.to_path_buf(),
            contents,
        }),
    }
}
