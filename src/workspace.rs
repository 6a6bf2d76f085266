use crate::config::WorkspaceConfig;
use crate::instrument::{self, InstrumentError, InstrumentationEngine};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Manages the temp copy of the project that gets instrumented and run.
///
/// The project is copied into `tmp_dir`, selected sources are instrumented in
/// place there, and the entry file gets the coverage capture hook. The
/// original sources are never modified.
#[derive(Debug, Clone)]
pub struct Workspace {
    project_dir: PathBuf,
    tmp_root: PathBuf,
    entry: PathBuf,
    snapshot_file: PathBuf,
    pid_file: PathBuf,
    exclude: Vec<String>,
}

/// Errors from preparing or instrumenting the workspace.
#[derive(Debug)]
pub enum WorkspaceError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
    Instrument {
        path: PathBuf,
        source: InstrumentError,
    },
}

impl std::fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceError::Io { path, source } => {
                write!(f, "workspace I/O error at {}: {}", path.display(), source)
            }
            WorkspaceError::Pattern { pattern, source } => {
                write!(f, "invalid include pattern '{pattern}': {source}")
            }
            WorkspaceError::Instrument { path, source } => {
                write!(f, "failed to instrument {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for WorkspaceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkspaceError::Io { source, .. } => Some(source),
            WorkspaceError::Pattern { source, .. } => Some(source),
            WorkspaceError::Instrument { source, .. } => Some(source),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Workspace {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            project_dir: config.project_dir.clone(),
            tmp_root: config.tmp_root(),
            entry: config.entry.clone(),
            snapshot_file: config.snapshot_file.clone(),
            pid_file: config.pid_file.clone(),
            exclude: config.exclude.clone(),
        }
    }

    /// The original project directory.
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// The temp copy of the project (e.g. `tmp/`).
    pub fn tmp_root(&self) -> &Path {
        &self.tmp_root
    }

    /// Entry file inside the temp copy that receives the capture hook.
    pub fn entry(&self) -> PathBuf {
        self.tmp_root.join(&self.entry)
    }

    /// Path the capture hook writes the coverage snapshot to.
    pub fn snapshot(&self) -> PathBuf {
        self.tmp_root.join(&self.snapshot_file)
    }

    /// Path of the pid sidecar for the run command.
    pub fn pid_file(&self) -> PathBuf {
        self.project_dir.join(&self.pid_file)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if path == self.tmp_root {
            return true;
        }
        path.file_name()
            .map(|name| self.exclude.iter().any(|e| name == e.as_str()))
            .unwrap_or(false)
    }

    /// Copy the project into the temp directory and clear any snapshot left
    /// behind by a previous run. Returns the number of files copied.
    pub fn prepare(&self) -> Result<usize, WorkspaceError> {
        std::fs::create_dir_all(&self.tmp_root).map_err(io_err(&self.tmp_root))?;

        let snapshot = self.snapshot();
        for stale in [snapshot.clone(), partial_path(&snapshot)] {
            match std::fs::remove_file(&stale) {
                Ok(()) => tracing::debug!(path = %stale.display(), "removed stale snapshot"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&stale)(e)),
            }
        }

        let copied = self.copy_tree(&self.project_dir, &self.tmp_root)?;
        tracing::info!(
            from = %self.project_dir.display(),
            to = %self.tmp_root.display(),
            files = copied,
            "copied project into workspace"
        );
        Ok(copied)
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> Result<usize, WorkspaceError> {
        std::fs::create_dir_all(to).map_err(io_err(to))?;
        let mut copied = 0;
        for entry in std::fs::read_dir(from).map_err(io_err(from))? {
            let entry = entry.map_err(io_err(from))?;
            let src = entry.path();
            if self.is_excluded(&src) {
                continue;
            }
            let dest = to.join(entry.file_name());
            // Follows symlinks; dangling links are skipped.
            let meta = match std::fs::metadata(&src) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(path = %src.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if meta.is_dir() {
                copied += self.copy_tree(&src, &dest)?;
            } else if meta.is_file() {
                std::fs::copy(&src, &dest).map_err(io_err(&src))?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Instrument every project file matching `include` in its temp copy.
    ///
    /// Globs are relative to the project directory; the engine is given the
    /// original file's path as display path so reports point at real
    /// sources. Returns the number of files instrumented.
    pub fn instrument_sources(
        &self,
        engine: &dyn InstrumentationEngine,
        include: &[String],
    ) -> Result<usize, WorkspaceError> {
        let mut sources = BTreeSet::new();
        for pattern in include {
            let full = self.project_dir.join(pattern);
            let full = full.to_string_lossy();
            let paths = glob::glob(&full).map_err(|e| WorkspaceError::Pattern {
                pattern: pattern.clone(),
                source: e,
            })?;
            for path in paths.flatten() {
                if path.is_file() && !path.starts_with(&self.tmp_root) {
                    sources.insert(path);
                }
            }
        }

        for real in &sources {
            let relative = real.strip_prefix(&self.project_dir).unwrap_or(real);
            let tmp_src = self.tmp_root.join(relative);
            let display_path = std::fs::canonicalize(real).unwrap_or_else(|_| real.clone());

            let source = std::fs::read_to_string(&tmp_src).map_err(io_err(&tmp_src))?;
            let instrumented =
                engine
                    .instrument(&source, &display_path)
                    .map_err(|e| WorkspaceError::Instrument {
                        path: real.clone(),
                        source: e,
                    })?;
            std::fs::write(&tmp_src, instrumented).map_err(io_err(&tmp_src))?;
            tracing::debug!(file = %display_path.display(), engine = engine.name(), "instrumented");
        }

        tracing::info!(files = sources.len(), engine = engine.name(), "instrumented sources");
        Ok(sources.len())
    }

    /// Append the coverage capture hook to the entry file.
    pub fn inject_capture(&self) -> Result<(), WorkspaceError> {
        let entry = self.entry();
        let snapshot = absolute(&self.snapshot());
        instrument::inject_capture(&entry, &snapshot).map_err(io_err(&entry))
    }
}

fn partial_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// The run command's working directory differs from ours, so the hook must
/// use an absolute snapshot path.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::tests::MarkerEngine;

    fn project() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("app/lib")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/dep")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("app.js"), "require('./app/main');\n").unwrap();
        std::fs::write(root.join("app/main.js"), "main();\n").unwrap();
        std::fs::write(root.join("app/lib/util.js"), "util();\n").unwrap();
        std::fs::write(root.join("app/readme.md"), "docs\n").unwrap();
        std::fs::write(root.join("node_modules/dep/index.js"), "dep();\n").unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref\n").unwrap();

        let config = WorkspaceConfig {
            project_dir: root.to_path_buf(),
            ..Default::default()
        };
        let ws = Workspace::new(&config);
        (dir, ws)
    }

    #[test]
    fn test_workspace_paths() {
        let config = WorkspaceConfig {
            project_dir: PathBuf::from("/proj"),
            ..Default::default()
        };
        let ws = Workspace::new(&config);
        assert_eq!(ws.tmp_root(), Path::new("/proj/tmp"));
        assert_eq!(ws.entry(), PathBuf::from("/proj/tmp/app.js"));
        assert_eq!(ws.snapshot(), PathBuf::from("/proj/tmp/coverage.json"));
        assert_eq!(ws.pid_file(), PathBuf::from("/proj/child.pid"));
        assert_eq!(
            partial_path(&ws.snapshot()),
            PathBuf::from("/proj/tmp/coverage.json.partial")
        );
    }

    #[test]
    fn test_prepare_copies_project_skipping_excludes() {
        let (_dir, ws) = project();
        let copied = ws.prepare().unwrap();
        assert_eq!(copied, 4);

        let tmp = ws.tmp_root();
        assert!(tmp.join("app.js").exists());
        assert!(tmp.join("app/lib/util.js").exists());
        assert!(tmp.join("app/readme.md").exists());
        assert!(!tmp.join("node_modules").exists());
        assert!(!tmp.join(".git").exists());
        assert!(!tmp.join("tmp").exists());
    }

    #[test]
    fn test_prepare_is_repeatable_and_clears_stale_snapshot() {
        let (_dir, ws) = project();
        ws.prepare().unwrap();
        std::fs::write(ws.snapshot(), "{}").unwrap();
        std::fs::write(partial_path(&ws.snapshot()), "{").unwrap();

        let copied = ws.prepare().unwrap();
        assert_eq!(copied, 4);
        assert!(!ws.snapshot().exists());
        assert!(!partial_path(&ws.snapshot()).exists());
    }

    #[test]
    fn test_instrument_sources_only_touches_temp_copies() {
        let (_dir, ws) = project();
        ws.prepare().unwrap();

        let count = ws
            .instrument_sources(&MarkerEngine, &["app/**/*.js".to_string()])
            .unwrap();
        assert_eq!(count, 2);

        let tmp_main = std::fs::read_to_string(ws.tmp_root().join("app/main.js")).unwrap();
        assert!(tmp_main.starts_with("/* cov:"));
        assert!(tmp_main.contains("app/main.js */"));
        assert!(tmp_main.ends_with("main();\n"));

        let real_main = std::fs::read_to_string(ws.project_dir().join("app/main.js")).unwrap();
        assert_eq!(real_main, "main();\n");

        let entry = std::fs::read_to_string(ws.entry()).unwrap();
        assert!(!entry.contains("cov:"));
    }

    #[test]
    fn test_instrument_sources_dedupes_overlapping_globs() {
        let (_dir, ws) = project();
        ws.prepare().unwrap();
        let count = ws
            .instrument_sources(
                &MarkerEngine,
                &["app/**/*.js".to_string(), "app/main.js".to_string()],
            )
            .unwrap();
        assert_eq!(count, 2);
        let tmp_main = std::fs::read_to_string(ws.tmp_root().join("app/main.js")).unwrap();
        assert_eq!(tmp_main.matches("cov:").count(), 1);
    }

    #[test]
    fn test_instrument_sources_bad_pattern() {
        let (_dir, ws) = project();
        let err = ws
            .instrument_sources(&MarkerEngine, &["app/[".to_string()])
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Pattern { .. }));
    }

    #[test]
    fn test_inject_capture_after_instrumentation() {
        let (_dir, ws) = project();
        ws.prepare().unwrap();
        ws.instrument_sources(&MarkerEngine, &["*.js".to_string()])
            .unwrap();
        ws.inject_capture().unwrap();

        let entry = std::fs::read_to_string(ws.entry()).unwrap();
        let last = entry.lines().last().unwrap();
        assert!(last.starts_with("process.on('SIGINT'"));
        assert!(last.contains(&ws.snapshot().to_string_lossy().into_owned()));
        assert!(entry.starts_with("/* cov:"));
    }

    #[test]
    fn test_inject_capture_missing_entry() {
        let (_dir, ws) = project();
        let err = ws.inject_capture().unwrap_err();
        assert!(matches!(err, WorkspaceError::Io { .. }));
    }
}
