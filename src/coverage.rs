//! Coverage snapshots and the per-run aggregate they are merged into.
//!
//! A snapshot is the istanbul-format object the instrumented app writes from
//! `global.__coverage__` when it receives SIGINT:
//!
//! ```json
//! {
//!   "/project/app/index.js": {
//!     "path": "/project/app/index.js",
//!     "s": { "1": 3, "2": 0 },
//!     "f": { "1": 1 },
//!     "b": { "1": [2, 0] },
//!     "statementMap": { ... },
//!     "fnMap": { ... },
//!     "branchMap": { ... }
//!   }
//! }
//! ```
//!
//! Only the hit counters are interpreted; the location maps are passed
//! through untouched to the report renderer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Execution counters for one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCoverage {
    #[serde(default)]
    pub path: String,
    /// Statement hit counts keyed by statement id.
    #[serde(default)]
    pub s: BTreeMap<String, u64>,
    /// Function hit counts keyed by function id.
    #[serde(default)]
    pub f: BTreeMap<String, u64>,
    /// Branch hit counts, one entry per branch arm.
    #[serde(default)]
    pub b: BTreeMap<String, Vec<u64>>,
    /// Location maps and anything else the instrumenter emitted.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FileCoverage {
    /// Add `other`'s counters into `self`.
    fn absorb(&mut self, other: FileCoverage) {
        for (id, hits) in other.s {
            let slot = self.s.entry(id).or_insert(0);
            *slot = slot.saturating_add(hits);
        }
        for (id, hits) in other.f {
            let slot = self.f.entry(id).or_insert(0);
            *slot = slot.saturating_add(hits);
        }
        for (id, arms) in other.b {
            let entry = self.b.entry(id).or_default();
            if entry.len() < arms.len() {
                entry.resize(arms.len(), 0);
            }
            for (slot, hits) in entry.iter_mut().zip(arms) {
                *slot = slot.saturating_add(hits);
            }
        }
        for (key, value) in other.extra {
            self.extra.entry(key).or_insert(value);
        }
    }
}

/// One coverage data file produced by a single run of the instrumented app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub files: BTreeMap<String, FileCoverage>,
}

impl Snapshot {
    /// Parse snapshot JSON.
    pub fn parse(json: &str) -> Result<Self, CoverageError> {
        serde_json::from_str(json).map_err(|e| CoverageError::Parse {
            detail: format!("invalid coverage JSON: {e}"),
        })
    }
}

/// Coverage accumulated over one or more snapshots.
///
/// Owned by a single run. Merging sums counters per file, so the final totals
/// do not depend on the order snapshots arrive in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageAggregate {
    files: BTreeMap<String, FileCoverage>,
    snapshots: usize,
}

impl CoverageAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a snapshot into the aggregate.
    pub fn merge(&mut self, snapshot: Snapshot) {
        for (name, file) in snapshot.files {
            match self.files.get_mut(&name) {
                Some(existing) => existing.absorb(file),
                None => {
                    self.files.insert(name, file);
                }
            }
        }
        self.snapshots += 1;
        tracing::debug!(
            files = self.files.len(),
            snapshots = self.snapshots,
            "merged coverage snapshot"
        );
    }

    /// Number of snapshots merged so far.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    #[allow(dead_code)]
    pub fn file(&self, name: &str) -> Option<&FileCoverage> {
        self.files.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Serialize the aggregate back into istanbul's coverage JSON, the input
    /// format report renderers consume.
    pub fn to_json(&self) -> Result<String, CoverageError> {
        serde_json::to_string(&self.files).map_err(|e| CoverageError::Parse {
            detail: format!("failed to serialize aggregate: {e}"),
        })
    }

    /// Totals across every file.
    pub fn summary(&self) -> CoverageSummary {
        let mut summary = CoverageSummary::default();
        for file in self.files.values() {
            summary.statements_total += file.s.len() as u64;
            summary.statements_covered += file.s.values().filter(|&&n| n > 0).count() as u64;
            summary.functions_total += file.f.len() as u64;
            summary.functions_covered += file.f.values().filter(|&&n| n > 0).count() as u64;
            for arms in file.b.values() {
                summary.branches_total += arms.len() as u64;
                summary.branches_covered += arms.iter().filter(|&&n| n > 0).count() as u64;
            }
        }
        summary
    }
}

/// Covered/total counts for the aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoverageSummary {
    pub statements_covered: u64,
    pub statements_total: u64,
    pub functions_covered: u64,
    pub functions_total: u64,
    pub branches_covered: u64,
    pub branches_total: u64,
}

fn percent(covered: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        covered as f64 * 100.0 / total as f64
    }
}

impl CoverageSummary {
    pub fn statement_percent(&self) -> f64 {
        percent(self.statements_covered, self.statements_total)
    }

    pub fn function_percent(&self) -> f64 {
        percent(self.functions_covered, self.functions_total)
    }

    pub fn branch_percent(&self) -> f64 {
        percent(self.branches_covered, self.branches_total)
    }
}

impl std::fmt::Display for CoverageSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "statements: {:.1}% ({}/{}), functions: {:.1}% ({}/{}), branches: {:.1}% ({}/{})",
            self.statement_percent(),
            self.statements_covered,
            self.statements_total,
            self.function_percent(),
            self.functions_covered,
            self.functions_total,
            self.branch_percent(),
            self.branches_covered,
            self.branches_total,
        )
    }
}

/// Errors from coverage data handling.
#[derive(Debug)]
pub enum CoverageError {
    /// Coverage JSON could not be parsed or produced.
    Parse { detail: String },
}

impl std::fmt::Display for CoverageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoverageError::Parse { detail } => write!(f, "{detail}"),
        }
    }
}

impl std::error::Error for CoverageError {}
