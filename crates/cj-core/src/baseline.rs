use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::QualityMetrics;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BaselineError {
    #[error("io error on baseline store: {0}")]
    Io(#[from] std::io::Error),
    #[error("baseline store parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Result of diffing a current snapshot against a stored one. Regressions
/// feed the alerting path; the delta is reported either way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsComparison {
    pub improvements: Vec<String>,
    pub regressions: Vec<String>,
    pub score_delta: f64,
}

impl MetricsComparison {
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// BaselineStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    entries: Vec<QualityMetrics>,
}

/// Append-only history of per-commit quality snapshots, persisted as a single
/// JSON file under the cache directory. Single writer, many readers; the
/// internal mutex orders appends by run completion.
pub struct BaselineStore {
    path: PathBuf,
    inner: Mutex<StoreFile>,
}

impl BaselineStore {
    /// Open (or create) the store at `<cache_dir>/baseline.json`.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self, BaselineError> {
        let path = cache_dir.into().join("baseline.json");
        let inner = if path.exists() {
            let bytes = std::fs::read(&path)?;
            match serde_json::from_slice(&bytes) {
                Ok(store) => store,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt baseline store, starting fresh");
                    StoreFile::default()
                }
            }
        } else {
            StoreFile::default()
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Append a snapshot and persist.
    pub fn append(&self, metrics: QualityMetrics) -> Result<(), BaselineError> {
        let mut inner = self.inner.lock().expect("baseline lock poisoned");
        inner.entries.push(metrics);
        self.persist(&inner)
    }

    fn persist(&self, inner: &StoreFile) -> Result<(), BaselineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(inner)?;
        std::fs::write(&self.path, bytes)?;
        debug!(path = %self.path.display(), entries = inner.entries.len(), "baseline persisted");
        Ok(())
    }

    /// Latest snapshot for a commit, or the overall latest when `commit` is
    /// `None`.
    pub fn lookup(&self, commit: Option<&str>) -> Option<QualityMetrics> {
        let inner = self.inner.lock().expect("baseline lock poisoned");
        match commit {
            Some(hash) => inner
                .entries
                .iter()
                .rev()
                .find(|m| m.commit.as_deref() == Some(hash))
                .cloned(),
            None => inner.entries.last().cloned(),
        }
    }

    /// The most recent `n` snapshots, oldest first.
    pub fn recent(&self, n: usize) -> Vec<QualityMetrics> {
        let inner = self.inner.lock().expect("baseline lock poisoned");
        let start = inner.entries.len().saturating_sub(n);
        inner.entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("baseline lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diff `current` against the stored snapshot for `baseline_commit`
    /// (latest when `None`). An empty store yields an empty comparison.
    pub fn compare(
        &self,
        current: &QualityMetrics,
        baseline_commit: Option<&str>,
    ) -> MetricsComparison {
        let Some(baseline) = self.lookup(baseline_commit) else {
            return MetricsComparison::default();
        };
        compare_metrics(current, &baseline)
    }
}

fn compare_metrics(current: &QualityMetrics, baseline: &QualityMetrics) -> MetricsComparison {
    let mut cmp = MetricsComparison {
        score_delta: current.score - baseline.score,
        ..Default::default()
    };

    // Higher-is-better scalars.
    diff_up(
        &mut cmp,
        "coverage",
        baseline.coverage_percent,
        current.coverage_percent,
    );
    diff_up(
        &mut cmp,
        "test pass rate",
        baseline.test_pass_rate,
        current.test_pass_rate,
    );

    // Lower-is-better counters.
    diff_down(&mut cmp, "type errors", baseline.type_errors, current.type_errors);
    diff_down(&mut cmp, "lint issues", baseline.lint_issues, current.lint_issues);
    diff_down(
        &mut cmp,
        "complexity violations",
        baseline.complexity_violations,
        current.complexity_violations,
    );
    diff_down(
        &mut cmp,
        "security issues",
        baseline.security_issues,
        current.security_issues,
    );
    diff_down(
        &mut cmp,
        "hook failures",
        baseline.hook_failures,
        current.hook_failures,
    );

    cmp
}

fn diff_up(cmp: &mut MetricsComparison, label: &str, before: f64, after: f64) {
    if after > before {
        cmp.improvements.push(format!("{label}: {before:.2} -> {after:.2}"));
    } else if after < before {
        cmp.regressions.push(format!("{label}: {before:.2} -> {after:.2}"));
    }
}

fn diff_down(cmp: &mut MetricsComparison, label: &str, before: u32, after: u32) {
    if after < before {
        cmp.improvements.push(format!("{label}: {before} -> {after}"));
    } else if after > before {
        cmp.regressions.push(format!("{label}: {before} -> {after}"));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(commit: &str, coverage: f64, lint: u32) -> QualityMetrics {
        QualityMetrics {
            commit: Some(commit.into()),
            coverage_percent: coverage,
            test_pass_rate: 1.0,
            type_errors: 0,
            lint_issues: lint,
            complexity_violations: 0,
            security_issues: 0,
            hook_failures: 0,
            score: QualityMetrics::compute_score(coverage, 1.0, lint),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn append_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        store.append(snapshot("aaa", 80.0, 2)).unwrap();
        store.append(snapshot("bbb", 85.0, 1)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup(None).unwrap().commit.as_deref(), Some("bbb"));
        assert_eq!(
            store.lookup(Some("aaa")).unwrap().coverage_percent,
            80.0
        );
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = BaselineStore::open(dir.path()).unwrap();
            store.append(snapshot("aaa", 75.0, 0)).unwrap();
        }
        let store = BaselineStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(None).unwrap().coverage_percent, 75.0);
    }

    #[test]
    fn corrupt_store_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("baseline.json"), b"{broken").unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn compare_detects_improvement_and_regression() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        store.append(snapshot("aaa", 80.0, 5)).unwrap();

        // Coverage up, lint down: improvements only.
        let cmp = store.compare(&snapshot("bbb", 85.0, 2), None);
        assert_eq!(cmp.improvements.len(), 2);
        assert!(!cmp.has_regressions());
        assert!(cmp.score_delta > 0.0);

        // Coverage down: regression.
        let cmp = store.compare(&snapshot("ccc", 70.0, 5), None);
        assert!(cmp.has_regressions());
        assert!(cmp.regressions[0].contains("coverage"));
    }

    #[test]
    fn compare_against_named_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        store.append(snapshot("old", 60.0, 0)).unwrap();
        store.append(snapshot("new", 90.0, 0)).unwrap();

        let cmp = store.compare(&snapshot("head", 70.0, 0), Some("old"));
        assert!(cmp.improvements.iter().any(|s| s.contains("coverage")));
    }

    #[test]
    fn compare_empty_store_is_neutral() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        let cmp = store.compare(&snapshot("aaa", 80.0, 0), None);
        assert!(cmp.improvements.is_empty());
        assert!(!cmp.has_regressions());
        assert_eq!(cmp.score_delta, 0.0);
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        for (i, commit) in ["a", "b", "c", "d"].iter().enumerate() {
            store.append(snapshot(commit, 50.0 + i as f64, 0)).unwrap();
        }
        let recent = store.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].commit.as_deref(), Some("c"));
        assert_eq!(recent[1].commit.as_deref(), Some("d"));
    }
}
