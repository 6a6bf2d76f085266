//! Report emission: pick one report format and hand the aggregate to a
//! renderer that writes it to the destination directory.

use crate::coverage::CoverageAggregate;
use std::path::{Path, PathBuf};
use std::process::Command;

/// The report formats a run can produce. Exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Html,
    /// HTML plus an lcov.info file.
    Lcov,
    LcovOnly,
    Cobertura,
}

impl ReportFormat {
    /// Reporter name as understood by istanbul-compatible renderers.
    pub fn as_str(self) -> &'static str {
        match self {
            ReportFormat::Html => "html",
            ReportFormat::Lcov => "lcov",
            ReportFormat::LcovOnly => "lcovonly",
            ReportFormat::Cobertura => "cobertura",
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format-selecting flags, as set in config or on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportOptions {
    pub html_lcov: bool,
    pub lcov_only: bool,
    pub cobertura: bool,
}

impl ReportOptions {
    /// First set flag wins in the order html_lcov, lcov_only, cobertura;
    /// with none set the report is html.
    pub fn select_format(&self) -> ReportFormat {
        if self.html_lcov {
            ReportFormat::Lcov
        } else if self.lcov_only {
            ReportFormat::LcovOnly
        } else if self.cobertura {
            ReportFormat::Cobertura
        } else {
            ReportFormat::Html
        }
    }
}

/// Where and how to write a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDescriptor {
    pub format: ReportFormat,
    pub destination: PathBuf,
}

impl ReportDescriptor {
    pub fn new(options: Option<&ReportOptions>, destination: impl Into<PathBuf>) -> Self {
        Self {
            format: options.map(ReportOptions::select_format).unwrap_or_default(),
            destination: destination.into(),
        }
    }
}

/// Errors from report emission.
#[derive(Debug)]
pub enum ReportError {
    /// The destination directory could not be created or written to.
    WriteFailure {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The aggregate could not be serialized for the renderer.
    Serialize { detail: String },
    /// Failed to execute the renderer command.
    Execute {
        command: String,
        source: std::io::Error,
    },
    /// The renderer command exited with non-zero status.
    RendererFailed { command: String, stderr: String },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::WriteFailure { path, source } => {
                write!(
                    f,
                    "report destination {} is not writable: {}",
                    path.display(),
                    source
                )
            }
            ReportError::Serialize { detail } => write!(f, "{detail}"),
            ReportError::Execute { command, source } => {
                write!(f, "failed to execute report command '{command}': {source}")
            }
            ReportError::RendererFailed { command, stderr } => {
                write!(
                    f,
                    "report command '{command}' failed:\n{}",
                    stderr.lines().take(30).collect::<Vec<_>>().join("\n")
                )
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::WriteFailure { source, .. } => Some(source),
            ReportError::Execute { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Writes a coverage aggregate in a given format.
pub trait ReportRenderer: Send + Sync {
    /// Render synchronously; the report must be on disk when this returns.
    fn render(
        &self,
        aggregate: &CoverageAggregate,
        descriptor: &ReportDescriptor,
    ) -> Result<(), ReportError>;
}

/// Renderer that runs an istanbul-compatible report command.
///
/// The aggregate is written as `coverage.json` into a scratch directory.
/// Placeholders in the arguments: `{reporter}`, `{coverage_dir}` (the scratch
/// directory), `{coverage_file}`, `{report_dir}`.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    command: String,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn build_args(
        &self,
        descriptor: &ReportDescriptor,
        coverage_dir: &Path,
        coverage_file: &Path,
    ) -> Vec<String> {
        let coverage_dir = coverage_dir.to_string_lossy();
        let coverage_file = coverage_file.to_string_lossy();
        let report_dir = descriptor.destination.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{reporter}", descriptor.format.as_str())
                    .replace("{coverage_dir}", &coverage_dir)
                    .replace("{coverage_file}", &coverage_file)
                    .replace("{report_dir}", &report_dir)
            })
            .collect()
    }
}

impl ReportRenderer for CommandRenderer {
    fn render(
        &self,
        aggregate: &CoverageAggregate,
        descriptor: &ReportDescriptor,
    ) -> Result<(), ReportError> {
        let json = aggregate.to_json().map_err(|e| ReportError::Serialize {
            detail: e.to_string(),
        })?;
        let scratch = tempfile::tempdir().map_err(|e| ReportError::WriteFailure {
            path: std::env::temp_dir(),
            source: e,
        })?;
        let coverage_file = scratch.path().join("coverage.json");
        std::fs::write(&coverage_file, json).map_err(|e| ReportError::WriteFailure {
            path: coverage_file.clone(),
            source: e,
        })?;

        let args = self.build_args(descriptor, scratch.path(), &coverage_file);
        tracing::debug!(command = %self.command, args = ?args, "running report command");
        let output = Command::new(&self.command)
            .args(&args)
            .output()
            .map_err(|e| ReportError::Execute {
                command: self.command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ReportError::RendererFailed {
                command: self.command.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// Ensure the destination exists and accepts new files.
fn check_writable(destination: &Path) -> Result<(), ReportError> {
    let fail = |source| ReportError::WriteFailure {
        path: destination.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(destination).map_err(fail)?;
    tempfile::NamedTempFile::new_in(destination)
        .map(drop)
        .map_err(fail)
}

/// Write one report for `aggregate` as described by `descriptor`.
///
/// Synchronous: the report is on disk when this returns.
pub fn emit(
    aggregate: &CoverageAggregate,
    descriptor: &ReportDescriptor,
    renderer: &dyn ReportRenderer,
) -> Result<(), ReportError> {
    check_writable(&descriptor.destination)?;
    renderer.render(aggregate, descriptor)?;
    tracing::info!(
        format = %descriptor.format,
        destination = %descriptor.destination.display(),
        files = aggregate.file_count(),
        "coverage report written"
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coverage::Snapshot;
    use std::sync::Mutex;

    /// Renderer that writes a placeholder file named after the format and
    /// remembers what it was asked to do.
    #[derive(Default)]
    pub(crate) struct StubRenderer {
        pub calls: Mutex<Vec<(ReportFormat, PathBuf, usize)>>,
    }

    impl ReportRenderer for StubRenderer {
        fn render(
            &self,
            aggregate: &CoverageAggregate,
            descriptor: &ReportDescriptor,
        ) -> Result<(), ReportError> {
            let name = match descriptor.format {
                ReportFormat::Html | ReportFormat::Lcov => "index.html",
                ReportFormat::LcovOnly => "lcov.info",
                ReportFormat::Cobertura => "cobertura-coverage.xml",
            };
            let path = descriptor.destination.join(name);
            std::fs::write(&path, aggregate.summary().to_string()).map_err(|e| {
                ReportError::WriteFailure {
                    path: path.clone(),
                    source: e,
                }
            })?;
            self.calls.lock().unwrap().push((
                descriptor.format,
                descriptor.destination.clone(),
                aggregate.file_count(),
            ));
            Ok(())
        }
    }

    fn aggregate() -> CoverageAggregate {
        let mut agg = CoverageAggregate::new();
        agg.merge(Snapshot::parse(r#"{"/p/a.js": {"s": {"1": 1, "2": 0}}}"#).unwrap());
        agg
    }

    #[test]
    fn test_select_format_single_flags() {
        let opts = |html_lcov, lcov_only, cobertura| ReportOptions {
            html_lcov,
            lcov_only,
            cobertura,
        };
        assert_eq!(opts(true, false, false).select_format().as_str(), "lcov");
        assert_eq!(opts(false, true, false).select_format().as_str(), "lcovonly");
        assert_eq!(opts(false, false, true).select_format().as_str(), "cobertura");
        assert_eq!(opts(false, false, false).select_format().as_str(), "html");
    }

    #[test]
    fn test_select_format_priority() {
        let all = ReportOptions {
            html_lcov: true,
            lcov_only: true,
            cobertura: true,
        };
        assert_eq!(all.select_format(), ReportFormat::Lcov);
        let two = ReportOptions {
            lcov_only: true,
            cobertura: true,
            ..Default::default()
        };
        assert_eq!(two.select_format(), ReportFormat::LcovOnly);
    }

    #[test]
    fn test_descriptor_without_options_is_html() {
        let descriptor = ReportDescriptor::new(None, "coverage");
        assert_eq!(descriptor.format, ReportFormat::Html);
        assert_eq!(descriptor.destination, PathBuf::from("coverage"));
    }

    #[test]
    fn test_emit_creates_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out/coverage");
        let renderer = StubRenderer::default();

        emit(&aggregate(), &ReportDescriptor::new(None, &dest), &renderer).unwrap();

        assert!(dest.join("index.html").exists());
        let calls = renderer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (ReportFormat::Html, dest.clone(), 1));
    }

    #[test]
    fn test_emit_unwritable_destination() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a dir").unwrap();
        let renderer = StubRenderer::default();

        let err = emit(
            &aggregate(),
            &ReportDescriptor::new(None, blocker.join("coverage")),
            &renderer,
        )
        .unwrap_err();
        assert!(matches!(err, ReportError::WriteFailure { .. }));
        assert!(renderer.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_command_renderer_placeholders() {
        let renderer = CommandRenderer::new(
            "nyc",
            vec![
                "report".to_string(),
                "--reporter={reporter}".to_string(),
                "--temp-dir={coverage_dir}".to_string(),
                "--report-dir={report_dir}".to_string(),
            ],
        );
        let descriptor = ReportDescriptor {
            format: ReportFormat::Cobertura,
            destination: PathBuf::from("/out"),
        };
        let args = renderer.build_args(
            &descriptor,
            Path::new("/scratch"),
            Path::new("/scratch/coverage.json"),
        );
        assert_eq!(
            args,
            vec![
                "report",
                "--reporter=cobertura",
                "--temp-dir=/scratch",
                "--report-dir=/out"
            ]
        );
    }

    #[test]
    fn test_command_renderer_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("coverage");
        let renderer = CommandRenderer::new(
            "sh",
            vec![
                "-c".to_string(),
                "cp \"$1\" \"$2/$3.json\"".to_string(),
                "sh".to_string(),
                "{coverage_file}".to_string(),
                "{report_dir}".to_string(),
                "{reporter}".to_string(),
            ],
        );
        let descriptor = ReportDescriptor::new(
            Some(&ReportOptions {
                lcov_only: true,
                ..Default::default()
            }),
            &dest,
        );

        emit(&aggregate(), &descriptor, &renderer).unwrap();

        let written = std::fs::read_to_string(dest.join("lcovonly.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["/p/a.js"]["s"]["1"], 1);
    }

    #[test]
    fn test_command_renderer_failure() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = CommandRenderer::new(
            "sh",
            vec!["-c".to_string(), "echo 'no reporter' >&2; exit 1".to_string()],
        );
        let err = emit(
            &aggregate(),
            &ReportDescriptor::new(None, dir.path()),
            &renderer,
        )
        .unwrap_err();
        assert!(matches!(err, ReportError::RendererFailed { .. }));
        assert!(err.to_string().contains("no reporter"));
    }

    #[test]
    fn test_command_renderer_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = CommandRenderer::new("nonexistent-reporter-xyz", vec![]);
        let err = emit(
            &aggregate(),
            &ReportDescriptor::new(None, dir.path()),
            &renderer,
        )
        .unwrap_err();
        assert!(matches!(err, ReportError::Execute { .. }));
    }
}
