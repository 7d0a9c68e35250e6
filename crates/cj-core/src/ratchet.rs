use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RatchetError {
    #[error("io error on ratchet state: {0}")]
    Io(#[from] std::io::Error),
    #[error("ratchet state parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Milestones celebrated as the baseline climbs.
const MILESTONES: [u32; 10] = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetSample {
    pub ts: DateTime<Utc>,
    pub coverage: f64,
}

/// Persistent ratchet record at `<cache_dir>/ratchet.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetState {
    pub baseline: f64,
    pub target: f64,
    pub milestones: Vec<u32>,
    pub history: Vec<RatchetSample>,
}

impl RatchetState {
    fn initial(coverage: f64) -> Self {
        Self {
            baseline: coverage,
            target: 100.0,
            milestones: MILESTONES
                .iter()
                .copied()
                .filter(|m| f64::from(*m) <= coverage)
                .collect(),
            history: vec![RatchetSample {
                ts: Utc::now(),
                coverage,
            }],
        }
    }
}

/// Outcome of feeding one observed coverage value through the ratchet.
#[derive(Debug, Clone, PartialEq)]
pub struct RatchetResult {
    pub baseline: f64,
    pub milestones_crossed: Vec<u32>,
    pub regression: bool,
    pub improved: bool,
}

// ---------------------------------------------------------------------------
// CoverageRatchet
// ---------------------------------------------------------------------------

/// Monotonic coverage floor.
///
/// The baseline initializes to the first observed coverage and never
/// decreases. A lower observation is a regression; a higher one advances the
/// baseline, records history, and reports crossed milestones.
pub struct CoverageRatchet {
    path: PathBuf,
    state: Option<RatchetState>,
}

impl CoverageRatchet {
    /// Open the ratchet backed by `<cache_dir>/ratchet.json`. Missing file
    /// means no baseline yet; the first update seeds it.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self, RatchetError> {
        let path = cache_dir.into().join("ratchet.json");
        let state = if path.exists() {
            let bytes = std::fs::read(&path)?;
            match serde_json::from_slice(&bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt ratchet state, reseeding");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self { path, state })
    }

    pub fn baseline(&self) -> Option<f64> {
        self.state.as_ref().map(|s| s.baseline)
    }

    pub fn state(&self) -> Option<&RatchetState> {
        self.state.as_ref()
    }

    /// Feed one observed coverage value through the ratchet and persist any
    /// state change.
    pub fn update(&mut self, coverage: f64) -> Result<RatchetResult, RatchetError> {
        let coverage = coverage.clamp(0.0, 100.0);

        let Some(state) = self.state.as_mut() else {
            let state = RatchetState::initial(coverage);
            info!(baseline = coverage, "coverage ratchet initialized");
            let result = RatchetResult {
                baseline: coverage,
                milestones_crossed: state.milestones.clone(),
                regression: false,
                improved: true,
            };
            self.state = Some(state);
            self.persist()?;
            return Ok(result);
        };

        if coverage < state.baseline {
            warn!(
                baseline = state.baseline,
                observed = coverage,
                "coverage regression"
            );
            return Ok(RatchetResult {
                baseline: state.baseline,
                milestones_crossed: Vec::new(),
                regression: true,
                improved: false,
            });
        }

        if coverage == state.baseline {
            return Ok(RatchetResult {
                baseline: state.baseline,
                milestones_crossed: Vec::new(),
                regression: false,
                improved: false,
            });
        }

        // Monotonic advance.
        let crossed: Vec<u32> = MILESTONES
            .iter()
            .copied()
            .filter(|m| f64::from(*m) > state.baseline && f64::from(*m) <= coverage)
            .collect();
        state.baseline = coverage;
        state.milestones.extend(crossed.iter().copied());
        state.history.push(RatchetSample {
            ts: Utc::now(),
            coverage,
        });
        info!(baseline = coverage, ?crossed, "coverage baseline advanced");

        let result = RatchetResult {
            baseline: coverage,
            milestones_crossed: crossed,
            regression: false,
            improved: true,
        };
        self.persist()?;
        Ok(result)
    }

    fn persist(&self) -> Result<(), RatchetError> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Rewrite the project manifest's declared minimum coverage
    /// (`fail_under` under `[tool.coverage.report]`) to the new baseline.
    /// Only that one value is ever written back.
    pub fn write_back_threshold(&self, pyproject: &Path) -> Result<bool, RatchetError> {
        let Some(state) = &self.state else {
            return Ok(false);
        };
        let text = match std::fs::read_to_string(pyproject) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let updated = rewrite_fail_under(&text, state.baseline);
        if updated == text {
            return Ok(false);
        }
        std::fs::write(pyproject, updated)?;
        info!(path = %pyproject.display(), fail_under = state.baseline, "coverage threshold written back");
        Ok(true)
    }
}

/// Replace the value of the first `fail_under = N` line; line-oriented so the
/// rest of the user's manifest is preserved byte-for-byte.
fn rewrite_fail_under(text: &str, baseline: f64) -> String {
    let mut out = Vec::with_capacity(text.len());
    let mut replaced = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if !replaced && (trimmed.starts_with("fail_under ") || trimmed.starts_with("fail_under=")) {
            let indent = &line[..line.len() - trimmed.len()];
            out.push(format!("{indent}fail_under = {baseline}"));
            replaced = true;
        } else {
            out.push(line.to_string());
        }
    }
    let mut joined = out.join("\n");
    if text.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
