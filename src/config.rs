use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from covwatch.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CovConfig {
    pub workspace: WorkspaceConfig,
    pub instrument: InstrumentConfig,
    pub run: RunConfig,
    pub watch: WatchConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub project_dir: PathBuf,
    /// Temp copy of the project, relative to `project_dir`.
    pub tmp_dir: PathBuf,
    /// Entry file inside `tmp_dir` that receives the SIGINT capture.
    pub entry: PathBuf,
    /// Snapshot file, relative to `tmp_dir`.
    pub snapshot_file: PathBuf,
    /// Pid sidecar, relative to `project_dir`.
    pub pid_file: PathBuf,
    /// File or directory names never copied into `tmp_dir`.
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Globs relative to `project_dir` selecting the sources to instrument.
    pub include: Vec<String>,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub command: String,
    pub args: Vec<String>,
    pub ready_pattern: String,
    /// Command run once the process is ready. Empty means wait for Ctrl-C.
    pub on_ready: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub destination: PathBuf,
    pub html_lcov: bool,
    pub lcov_only: bool,
    pub cobertura: bool,
    pub command: String,
    pub args: Vec<String>,
}

/// Errors from loading or validating the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid { field: &'static str, detail: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, detail } => {
                write!(f, "invalid config value for {field}: {detail}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl CovConfig {
    /// Load the config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "run.command",
                detail: "must not be empty".to_string(),
            });
        }
        regex::Regex::new(&self.run.ready_pattern).map_err(|e| ConfigError::Invalid {
            field: "run.ready_pattern",
            detail: e.to_string(),
        })?;
        if self.instrument.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "instrument.command",
                detail: "must not be empty".to_string(),
            });
        }
        if self.report.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "report.command",
                detail: "must not be empty".to_string(),
            });
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "watch.poll_interval_ms",
                detail: "must be greater than zero".to_string(),
            });
        }
        if self.watch.max_poll_interval_ms < self.watch.poll_interval_ms {
            return Err(ConfigError::Invalid {
                field: "watch.max_poll_interval_ms",
                detail: format!(
                    "must be at least poll_interval_ms ({})",
                    self.watch.poll_interval_ms
                ),
            });
        }
        if self.watch.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "watch.timeout_secs",
                detail: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl WorkspaceConfig {
    pub fn tmp_root(&self) -> PathBuf {
        self.project_dir.join(&self.tmp_dir)
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// --- Default implementations ---

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            tmp_dir: PathBuf::from("tmp"),
            entry: PathBuf::from("app.js"),
            snapshot_file: PathBuf::from("coverage.json"),
            pid_file: PathBuf::from("child.pid"),
            exclude: vec![
                ".git".to_string(),
                "tmp".to_string(),
                "node_modules".to_string(),
            ],
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            include: vec!["app/**/*.js".to_string()],
            command: "nyc".to_string(),
            args: vec!["instrument".to_string(), "{path}".to_string()],
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            command: "appc".to_string(),
            args: vec![
                "run".to_string(),
                "--project-dir".to_string(),
                "{tmp_dir}".to_string(),
            ],
            ready_pattern: "Arrow Server started".to_string(),
            on_ready: Vec::new(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_poll_interval_ms: 2000,
            timeout_secs: 60,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("coverage"),
            html_lcov: false,
            lcov_only: false,
            cobertura: false,
            command: "nyc".to_string(),
            args: vec![
                "report".to_string(),
                "--reporter={reporter}".to_string(),
                "--temp-dir={coverage_dir}".to_string(),
                "--report-dir={report_dir}".to_string(),
            ],
        }
    }
}
