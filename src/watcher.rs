/// Coverage snapshot watcher.
///
/// After the run command has been sent SIGINT, its capture handler writes the
/// coverage snapshot and exits. The watcher polls for that file with
/// exponential backoff until it appears or the timeout elapses.
use crate::coverage::Snapshot;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Smallest delay ever used between existence checks.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Errors from waiting for a coverage snapshot.
#[derive(Debug)]
pub enum WatchError {
    /// The snapshot did not appear within the configured timeout.
    Timeout {
        path: PathBuf,
        waited: Duration,
        attempts: u32,
    },
    /// The file exists but is not valid coverage data. Never retried.
    Corrupt { path: PathBuf, detail: String },
    /// The snapshot path could not be checked or the file could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Timeout {
                path,
                waited,
                attempts,
            } => write!(
                f,
                "coverage snapshot {} did not appear after {:.1}s ({} checks)",
                path.display(),
                waited.as_secs_f64(),
                attempts
            ),
            WatchError::Corrupt { path, detail } => {
                write!(f, "coverage snapshot {} is corrupt: {}", path.display(), detail)
            }
            WatchError::Read { path, source } => {
                write!(
                    f,
                    "failed to read coverage snapshot {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Exponential backoff between existence checks.
///
/// Starts at `initial`, doubles after every miss, and is capped at `max`.
/// Tracks how many retries have been scheduled.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    initial: Duration,
    max: Duration,
    retries: u32,
}

impl PollBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_POLL_INTERVAL);
        Self {
            initial,
            max: max.max(initial),
            retries: 0,
        }
    }

    /// Delay before the next check. Each call counts as one retry.
    pub fn next_delay(&mut self) -> Duration {
        let shift = 1u32.checked_shl(self.retries.min(31)).unwrap_or(u32::MAX);
        let delay = self.initial.saturating_mul(shift).min(self.max);
        self.retries += 1;
        delay
    }

    /// Number of retries scheduled so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Waits for the snapshot the instrumented app writes on shutdown.
///
/// Callers must signal the run command to stop before polling; the watcher
/// does not enforce that ordering itself.
#[derive(Debug, Clone)]
pub struct SnapshotWatcher {
    poll_interval: Duration,
    max_poll_interval: Duration,
    timeout: Duration,
}

impl SnapshotWatcher {
    pub fn new(poll_interval: Duration, max_poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            max_poll_interval,
            timeout,
        }
    }

    /// Wait for `path` to appear, then read and parse it.
    pub async fn await_snapshot(&self, path: &Path) -> Result<Snapshot, WatchError> {
        let mut backoff = PollBackoff::new(self.poll_interval, self.max_poll_interval);
        self.poll(path, &mut backoff).await
    }

    /// Polling loop behind [`await_snapshot`](Self::await_snapshot), driven by
    /// a caller-supplied backoff.
    pub async fn poll(
        &self,
        path: &Path,
        backoff: &mut PollBackoff,
    ) -> Result<Snapshot, WatchError> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        tracing::info!(
            path = %path.display(),
            timeout_secs = self.timeout.as_secs_f64(),
            "waiting for coverage snapshot"
        );

        loop {
            if snapshot_exists(path).await? {
                return read_snapshot(path).await;
            }

            let now = Instant::now();
            if now >= deadline {
                let attempts = backoff.retries() + 1;
                tracing::warn!(
                    path = %path.display(),
                    attempts,
                    "timed out waiting for coverage snapshot"
                );
                return Err(WatchError::Timeout {
                    path: path.to_path_buf(),
                    waited: now - start,
                    attempts,
                });
            }

            let delay = backoff.next_delay().min(deadline - now);
            tracing::debug!(
                path = %path.display(),
                retry = backoff.retries(),
                delay_ms = delay.as_millis() as u64,
                "coverage snapshot not present yet"
            );
            tokio::time::sleep(delay.max(MIN_POLL_INTERVAL)).await;
        }
    }
}

/// Only "not found" counts as absent; any other failure to stat the path is
/// reported instead of being waited out.
async fn snapshot_exists(path: &Path) -> Result<bool, WatchError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| WatchError::Read {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Read and parse a snapshot file. Parse failures are final.
pub async fn read_snapshot(path: &Path) -> Result<Snapshot, WatchError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| WatchError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
    let snapshot = Snapshot::parse(&contents).map_err(|e| WatchError::Corrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    tracing::info!(
        path = %path.display(),
        files = snapshot.files.len(),
        "loaded coverage snapshot"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageAggregate;

    const VALID: &str = r#"{"/p/app.js": {"path": "/p/app.js", "s": {"1": 1, "2": 0}}}"#;

    fn watcher(interval_ms: u64, timeout_ms: u64) -> SnapshotWatcher {
        SnapshotWatcher::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(interval_ms * 4),
            Duration::from_millis(timeout_ms),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = PollBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.retries(), 4);
    }

    #[test]
    fn test_backoff_never_zero() {
        let mut backoff = PollBackoff::new(Duration::ZERO, Duration::ZERO);
        for _ in 0..5 {
            assert!(backoff.next_delay() > Duration::ZERO);
        }
    }

    #[test]
    fn test_backoff_survives_many_retries() {
        let mut backoff = PollBackoff::new(Duration::from_millis(10), Duration::from_secs(2));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_snapshot_already_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coverage.json");
        std::fs::write(&path, VALID).unwrap();

        let mut backoff = PollBackoff::new(Duration::from_millis(50), Duration::from_millis(50));
        let snapshot = watcher(50, 1000).poll(&path, &mut backoff).await.unwrap();
        assert_eq!(snapshot.files.len(), 1);
        assert_eq!(backoff.retries(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_appears_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coverage.json");
        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            std::fs::write(&writer_path, VALID).unwrap();
        });

        let snapshot = SnapshotWatcher::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_secs(2),
        )
        .await_snapshot(&path)
        .await
        .unwrap();

        let mut agg = CoverageAggregate::new();
        agg.merge(snapshot);
        assert_eq!(agg.summary().statements_total, 2);
    }

    #[tokio::test]
    async fn test_snapshot_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.json");

        let start = std::time::Instant::now();
        let err = watcher(50, 300).await_snapshot(&path).await.unwrap_err();
        let elapsed = start.elapsed();

        match &err {
            WatchError::Timeout { attempts, .. } => assert!(*attempts >= 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(2));
        assert!(err.to_string().contains("never.json"));
    }

    #[tokio::test]
    async fn test_timeout_polls_with_delay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.json");
        let mut backoff = PollBackoff::new(Duration::from_millis(100), Duration::from_millis(100));
        let _ = watcher(100, 450).poll(&path, &mut backoff).await;
        // A busy loop would rack up thousands of checks in 450ms.
        assert!(backoff.retries() <= 6, "retries = {}", backoff.retries());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coverage.json");
        std::fs::write(&path, "undefined").unwrap();

        let mut backoff = PollBackoff::new(Duration::from_millis(10), Duration::from_millis(10));
        let err = watcher(10, 5000).poll(&path, &mut backoff).await.unwrap_err();
        assert!(matches!(err, WatchError::Corrupt { .. }));
        assert_eq!(backoff.retries(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_appearing_late_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coverage.json");
        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&writer_path, "{ not json").unwrap();
        });

        let start = std::time::Instant::now();
        let err = watcher(20, 5000).await_snapshot(&path).await.unwrap_err();
        assert!(matches!(err, WatchError::Corrupt { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_uncheckable_path_is_reported_not_waited_out() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let watcher = SnapshotWatcher::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );

        let start = std::time::Instant::now();
        let err = watcher
            .await_snapshot(&blocker.join("coverage.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Read { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_watch_error_display() {
        let err = WatchError::Timeout {
            path: PathBuf::from("tmp/coverage.json"),
            waited: Duration::from_millis(2500),
            attempts: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("tmp/coverage.json"));
        assert!(msg.contains("2.5s"));
        assert!(msg.contains("7 checks"));
    }
}
