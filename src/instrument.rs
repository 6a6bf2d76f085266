//! Source instrumentation and the SIGINT coverage capture.
//!
//! Instrumentation itself is delegated to an external engine (by default
//! `nyc instrument`). This module only feeds it source text and appends the
//! shutdown hook that writes `global.__coverage__` to the snapshot path.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

/// Errors from instrumenting a source file.
#[derive(Debug)]
pub enum InstrumentError {
    /// Failed to execute the instrumenter command.
    Execute {
        command: String,
        source: std::io::Error,
    },
    /// The instrumenter exited with non-zero status.
    CommandFailed {
        command: String,
        path: String,
        stderr: String,
    },
}

impl std::fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentError::Execute { command, source } => {
                write!(f, "failed to execute instrumenter '{command}': {source}")
            }
            InstrumentError::CommandFailed {
                command,
                path,
                stderr,
            } => {
                write!(
                    f,
                    "instrumenter '{command}' failed on {path}:\n{}",
                    stderr.lines().take(30).collect::<Vec<_>>().join("\n")
                )
            }
        }
    }
}

impl std::error::Error for InstrumentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstrumentError::Execute { source, .. } => Some(source),
            InstrumentError::CommandFailed { .. } => None,
        }
    }
}

/// Turns source text into instrumented source text.
pub trait InstrumentationEngine: Send + Sync {
    /// Human-readable engine name for logs.
    fn name(&self) -> &str;

    /// Instrument `source`. `display_path` is the original file's path and is
    /// what coverage reports will refer to.
    fn instrument(&self, source: &str, display_path: &Path) -> Result<String, InstrumentError>;
}

/// Engine that pipes source through an external command.
///
/// The source text is written to the command's stdin and the instrumented
/// text is read from its stdout. `{path}` in an argument is replaced with the
/// display path.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    command: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn build_args(&self, display_path: &Path) -> Vec<String> {
        let path = display_path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{path}", &path))
            .collect()
    }
}

impl InstrumentationEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.command
    }

    fn instrument(&self, source: &str, display_path: &Path) -> Result<String, InstrumentError> {
        let args = self.build_args(display_path);
        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| InstrumentError::Execute {
                command: self.command.clone(),
                source: e,
            })?;

        // Feed stdin from its own thread so a large file cannot deadlock
        // against the engine filling its stdout pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let source = source.to_owned();
            std::thread::spawn(move || match stdin.write_all(source.as_bytes()) {
                // Engines that read the file from `{path}` may close stdin early.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            })
        });

        let output = child
            .wait_with_output()
            .map_err(|e| InstrumentError::Execute {
                command: self.command.clone(),
                source: e,
            })?;

        if let Some(writer) = writer {
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            written.map_err(|e| InstrumentError::Execute {
                command: self.command.clone(),
                source: e,
            })?;
        }

        if !output.status.success() {
            return Err(InstrumentError::CommandFailed {
                command: self.command.clone(),
                path: display_path.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// JavaScript appended to the entry file. On SIGINT it writes the global
/// coverage object to a side file, renames it over the snapshot path so a
/// reader never sees a half-written file, and exits.
pub fn capture_snippet(snapshot_path: &Path) -> String {
    let target = serde_json::Value::String(snapshot_path.to_string_lossy().into_owned());
    let partial = serde_json::Value::String(format!("{}.partial", snapshot_path.to_string_lossy()));
    format!(
        "process.on('SIGINT', function () {{ var fs = require('fs'); \
fs.writeFileSync({partial}, JSON.stringify(global.__coverage__ || {{}})); \
fs.renameSync({partial}, {target}); process.exit(); }});"
    )
}

/// Append the capture hook to `entry`. Must run after instrumentation so the
/// hook is not itself instrumented.
pub fn inject_capture(entry: &Path, snapshot_path: &Path) -> std::io::Result<()> {
    let mut contents = std::fs::read_to_string(entry)?;
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&capture_snippet(snapshot_path));
    contents.push('\n');
    std::fs::write(entry, contents)?;
    tracing::debug!(
        entry = %entry.display(),
        snapshot = %snapshot_path.display(),
        "injected coverage capture hook"
    );
    Ok(())
}
