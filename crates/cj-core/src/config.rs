use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading config: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from `<project>/crackerjack.toml`, with a
/// fixed set of environment overrides applied once at init. There is no live
/// reconfiguration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub tests: TestsConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Worker pool cap; 0 means auto (logical cores, capped at 8).
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default = "default_fast_timeout")]
    pub fast_timeout_secs: u64,
    #[serde(default = "default_comprehensive_timeout")]
    pub comprehensive_timeout_secs: u64,
    /// Hook ids disabled for this project.
    #[serde(default)]
    pub disabled: Vec<String>,
}

fn default_fast_timeout() -> u64 {
    60
}

fn default_comprehensive_timeout() -> u64 {
    300
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            fast_timeout_secs: default_fast_timeout(),
            comprehensive_timeout_secs: default_comprehensive_timeout(),
            disabled: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsConfig {
    /// Test worker count; 0 means auto.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,
    /// Directory handed to the runner; defaults to the project root.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_session_timeout() -> u64 {
    600
}

fn default_stuck_threshold() -> u64 {
    60
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            session_timeout_secs: default_session_timeout(),
            stuck_threshold_secs: default_stuck_threshold(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_confidence() -> f64 {
    0.7
}

fn default_max_concurrent() -> usize {
    4
}

fn default_agent_timeout() -> u64 {
    300
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence(),
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_agent_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Cache directory; defaults to `<project>/.crackerjack/cache`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_ttl() -> u64 {
    24 * 60 * 60
}

fn default_max_entries() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            max_entries: default_max_entries(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Validation failures tolerated per minute before the gate trips.
    #[serde(default = "default_failure_budget")]
    pub failure_budget_per_minute: u64,
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_failure_budget() -> u64 {
    10
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            failure_budget_per_minute: default_failure_budget(),
        }
    }
}

impl Config {
    /// Load from `<root>/crackerjack.toml`, falling back to defaults when the
    /// file does not exist, then apply environment overrides.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join("crackerjack.toml");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// The fixed environment variable set, read once. Unparseable values are
    /// ignored rather than fatal.
    fn apply_env(&mut self) {
        if let Some(ttl) = env_parse::<u64>("CRACKERJACK_CACHE_TTL") {
            self.cache.ttl_secs = ttl;
        }
        if let Some(workers) = env_parse::<usize>("CRACKERJACK_WORKERS") {
            self.hooks.max_workers = workers;
        }
        if let Some(confidence) = env_parse::<f64>("CRACKERJACK_CONFIDENCE") {
            if (0.0..=1.0).contains(&confidence) {
                self.agents.confidence_threshold = confidence;
            }
        }
        if let Some(timeout) = env_parse::<u64>("CRACKERJACK_AGENT_TIMEOUT") {
            self.agents.timeout_secs = timeout;
        }
    }

    /// Cache directory for this project.
    pub fn cache_dir(&self, root: &Path) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| root.join(".crackerjack").join("cache"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => {
            debug!(key, value = %raw, "environment override applied");
            Some(value)
        }
        Err(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
