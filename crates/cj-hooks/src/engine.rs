use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cj_core::cache::{hash_file_set, CacheKey, HookCache};
use cj_core::config::HooksConfig;
use cj_core::types::{HookResult, HookStatus, Issue, IssueKind};
use cj_guard::subprocess::{CommandOutput, CommandSpec, SubprocessError, SubprocessExecutor};
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::definitions::{by_category, HookCategory, HookDefinition};
use crate::graph::schedule;
use crate::parse;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Published after each hook completes, for progress consumers.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub hook_id: String,
    pub status: HookStatus,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HookEngineConfig {
    pub max_workers: usize,
    pub fast_timeout: Duration,
    pub comprehensive_timeout: Duration,
    pub disabled: Vec<String>,
}

impl HookEngineConfig {
    pub fn from_config(config: &HooksConfig) -> Self {
        let max_workers = if config.max_workers == 0 {
            num_cpus::get().min(8)
        } else {
            config.max_workers
        };
        Self {
            max_workers,
            fast_timeout: Duration::from_secs(config.fast_timeout_secs),
            comprehensive_timeout: Duration::from_secs(config.comprehensive_timeout_secs),
            disabled: config.disabled.clone(),
        }
    }
}

impl Default for HookEngineConfig {
    fn default() -> Self {
        Self::from_config(&HooksConfig::default())
    }
}

// ---------------------------------------------------------------------------
// HookEngine
// ---------------------------------------------------------------------------

/// Runs fast and comprehensive hook suites: deterministic batch scheduling,
/// a bounded worker pool, result memoization, retry, and timeout policy.
pub struct HookEngine {
    root: PathBuf,
    executor: Arc<SubprocessExecutor>,
    cache: Arc<HookCache>,
    config: HookEngineConfig,
    /// Tool versions probed once per process.
    versions: DashMap<String, String>,
    events: Option<flume::Sender<HookEvent>>,
}

impl HookEngine {
    pub fn new(
        root: impl Into<PathBuf>,
        executor: Arc<SubprocessExecutor>,
        cache: Arc<HookCache>,
        config: HookEngineConfig,
    ) -> Self {
        Self {
            root: root.into(),
            executor,
            cache,
            config,
            versions: DashMap::new(),
            events: None,
        }
    }

    /// Attach a progress channel; each completed hook publishes one event.
    pub fn with_events(mut self, events: flume::Sender<HookEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn run_fast(&self, files: Option<&[PathBuf]>) -> Vec<HookResult> {
        self.run_category(HookCategory::Fast, files).await
    }

    pub async fn run_comprehensive(&self, files: Option<&[PathBuf]>) -> Vec<HookResult> {
        self.run_category(HookCategory::Comprehensive, files).await
    }

    /// Run a single hook by id, scoped to `files`. Used by fix verification.
    pub async fn run_one(&self, hook_id: &str, files: Option<&[PathBuf]>) -> Option<HookResult> {
        let definition = crate::definitions::by_id(hook_id)?;
        Some(self.run_hook(definition, files).await)
    }

    async fn run_category(
        &self,
        category: HookCategory,
        files: Option<&[PathBuf]>,
    ) -> Vec<HookResult> {
        let hooks: Vec<&HookDefinition> = by_category(category)
            .into_iter()
            .filter(|h| !self.config.disabled.iter().any(|d| d == h.id))
            .collect();
        let batches = schedule(&hooks);
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));

        info!(
            category = ?category,
            hooks = hooks.len(),
            batches = batches.len(),
            workers = self.config.max_workers,
            "running hook suite"
        );

        let mut results = Vec::with_capacity(hooks.len());
        // Barrier between batches: readers observe every mutator's writes.
        for batch in batches {
            let mut handles = Vec::with_capacity(batch.len());
            for definition in batch {
                let permit = Arc::clone(&semaphore);
                let files = files.map(|f| f.to_vec());
                let engine = self;
                handles.push(async move {
                    let _permit = permit.acquire().await.expect("semaphore closed");
                    engine.run_hook(definition, files.as_deref()).await
                });
            }
            let batch_results = futures::future::join_all(handles).await;
            for result in batch_results {
                self.publish(&result);
                results.push(result);
            }
        }
        results
    }

    async fn run_hook(
        &self,
        definition: &HookDefinition,
        files: Option<&[PathBuf]>,
    ) -> HookResult {
        let relevant = self.relevant_files(definition, files);
        if relevant.is_empty() {
            debug!(hook = definition.id, "no relevant files, passing without invocation");
            return HookResult::passed(definition.id);
        }

        let timeout = match definition.category {
            HookCategory::Fast => self.config.fast_timeout,
            HookCategory::Comprehensive => self.config.comprehensive_timeout,
        }
        .min(Duration::from_secs(definition.timeout_secs.max(1)));

        // Version probe + content hash form the cache key.
        let version = self.tool_version(definition).await;
        let key = CacheKey::new(
            definition.id,
            version,
            hash_file_set(&self.root, &relevant),
        );
        if let Some(hit) = self.cache.get(&key, definition.expensive) {
            return hit;
        }

        let mut result = self
            .invoke_and_parse(definition, &relevant, timeout, false)
            .await;

        // Transient-failure retry: non-zero exit with empty stderr.
        if result.status == HookStatus::Failed
            && result.exit_code.is_some_and(|c| c != 0)
            && result.stderr.trim().is_empty()
            && result.issues.is_empty()
        {
            debug!(hook = definition.id, "empty-stderr failure, retrying once");
            result = self
                .invoke_and_parse(definition, &relevant, timeout, false)
                .await;
        }

        // Parse-failure retry with the hook's cache-busting flag.
        if result.status == HookStatus::Error
            && result.error_is_parse()
            && definition.no_cache_flag.is_some()
        {
            debug!(hook = definition.id, "parse failure, retrying with no-cache flag");
            result = self
                .invoke_and_parse(definition, &relevant, timeout, true)
                .await;
        }

        if result.status == HookStatus::Passed {
            result.cache_key = Some(key.fingerprint());
            self.cache.put(key, result.clone());
        }
        result
    }

    async fn invoke_and_parse(
        &self,
        definition: &HookDefinition,
        relevant: &[PathBuf],
        timeout: Duration,
        with_no_cache: bool,
    ) -> HookResult {
        let mut spec = CommandSpec::new(definition.program, &self.root)
            .args(definition.args.iter().map(|s| s.to_string()))
            .timeout(timeout);
        if with_no_cache {
            if let Some(flag) = definition.no_cache_flag {
                spec = spec.arg(flag);
            }
        }
        if definition.takes_files {
            spec = spec.args(relevant.iter().map(|p| p.display().to_string()));
        }

        let started = std::time::Instant::now();
        let output = match self.executor.run(spec).await {
            Ok(output) => output,
            Err(SubprocessError::NotFound(program)) => {
                warn!(hook = definition.id, program, "tool not found");
                return HookResult {
                    hook_id: definition.id.to_string(),
                    status: HookStatus::Error,
                    duration_ms: started.elapsed().as_millis() as u64,
                    stdout: String::new(),
                    stderr: format!("tool `{program}` not found"),
                    exit_code: None,
                    issues: vec![Issue::new(
                        IssueKind::Dependency,
                        definition.id,
                        format!("tool `{program}` not found"),
                    )],
                    cache_key: None,
                };
            }
            Err(e) => {
                warn!(hook = definition.id, error = %e, "tool launch failed");
                return HookResult {
                    hook_id: definition.id.to_string(),
                    status: HookStatus::Error,
                    duration_ms: started.elapsed().as_millis() as u64,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    exit_code: None,
                    issues: Vec::new(),
                    cache_key: None,
                };
            }
        };

        self.result_from_output(definition, output)
    }

    fn result_from_output(
        &self,
        definition: &HookDefinition,
        output: CommandOutput,
    ) -> HookResult {
        let duration_ms = output.duration.as_millis() as u64;

        if output.timed_out {
            return HookResult {
                hook_id: definition.id.to_string(),
                status: HookStatus::TimedOut,
                duration_ms,
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: None,
                issues: Vec::new(),
                cache_key: None,
            };
        }

        match parse::parse(
            definition.parser,
            definition.id,
            &output.stdout,
            &output.stderr,
        ) {
            Ok(issues) => {
                let status = if output.exit_code == Some(0) && issues.is_empty() {
                    HookStatus::Passed
                } else {
                    HookStatus::Failed
                };
                HookResult {
                    hook_id: definition.id.to_string(),
                    status,
                    duration_ms,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code,
                    issues,
                    cache_key: None,
                }
            }
            // No phantom issues: the raw output is preserved, the issue list
            // stays empty.
            Err(e) => {
                warn!(hook = definition.id, error = %e, "output parse failed");
                HookResult {
                    hook_id: definition.id.to_string(),
                    status: HookStatus::Error,
                    duration_ms,
                    stdout: output.stdout,
                    stderr: format!("{}\n[parse error: {e}]", output.stderr),
                    exit_code: output.exit_code,
                    issues: Vec::new(),
                    cache_key: None,
                }
            }
        }
    }

    async fn tool_version(&self, definition: &HookDefinition) -> String {
        if let Some(version) = self.versions.get(definition.program) {
            return version.clone();
        }
        let spec = CommandSpec::new(definition.program, &self.root)
            .args(definition.version_args.iter().map(|s| s.to_string()))
            .timeout(Duration::from_secs(10));
        let version = match self.executor.run(spec).await {
            Ok(output) if output.success() => output.stdout.trim().to_string(),
            _ => "unknown".to_string(),
        };
        self.versions
            .insert(definition.program.to_string(), version.clone());
        version
    }

    /// Files the hook's declared extensions select, either from the provided
    /// scope or by walking the project tree.
    fn relevant_files(
        &self,
        definition: &HookDefinition,
        files: Option<&[PathBuf]>,
    ) -> Vec<PathBuf> {
        let matches_ext = |path: &Path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| definition.extensions.contains(&e))
                .unwrap_or(false)
        };

        let mut relevant: Vec<PathBuf> = match files {
            Some(files) => files
                .iter()
                .filter(|p| matches_ext(p))
                .map(|p| {
                    if p.is_absolute() {
                        p.clone()
                    } else {
                        self.root.join(p)
                    }
                })
                .collect(),
            None => walkdir::WalkDir::new(&self.root)
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !is_ignored_dir(entry))
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| matches_ext(p))
                .collect(),
        };
        relevant.sort();
        relevant
    }

    fn publish(&self, result: &HookResult) {
        if let Some(events) = &self.events {
            let _ = events.try_send(HookEvent {
                hook_id: result.hook_id.clone(),
                status: result.status,
                duration_ms: result.duration_ms,
            });
        }
    }
}

fn is_ignored_dir(entry: &walkdir::DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.')
        || name == "node_modules"
        || name == "__pycache__"
        || name == "venv"
        || name == "build"
        || name == "dist"
}

trait HookResultExt {
    fn error_is_parse(&self) -> bool;
}

impl HookResultExt for HookResult {
    fn error_is_parse(&self) -> bool {
        self.stderr.contains("[parse error:")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cj_guard::events::SecurityLog;
    use cj_guard::paths::PathValidator;

    fn make_engine(root: &Path) -> HookEngine {
        let executor = Arc::new(SubprocessExecutor::new(
            PathValidator::new(root).unwrap(),
            Arc::new(SecurityLog::default()),
        ));
        let cache = Arc::new(HookCache::in_memory(Duration::from_secs(3600)));
        HookEngine::new(root, executor, cache, HookEngineConfig::default())
    }

    #[tokio::test]
    async fn empty_file_set_passes_without_invocation() {
        let dir = tempfile::tempdir().unwrap();
        // No .py files at all; every python hook passes untouched. The
        // programs do not even exist in the test environment, which proves
        // nothing was spawned.
        let engine = make_engine(dir.path());
        let results = engine.run_fast(None).await;
        assert!(!results.is_empty());
        for result in &results {
            assert_eq!(result.status, HookStatus::Passed, "{}", result.hook_id);
        }
    }

    #[tokio::test]
    async fn missing_tool_becomes_dependency_issue() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "x = 1\n").unwrap();
        let engine = make_engine(dir.path());

        let result = engine
            .run_one("ruff-check", Some(&[PathBuf::from("app.py")]))
            .await
            .unwrap();
        // `ruff` is not installed in the test environment.
        assert_eq!(result.status, HookStatus::Error);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].kind, IssueKind::Dependency);
    }

    #[tokio::test]
    async fn scoped_files_filter_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "# notes\n").unwrap();
        let engine = make_engine(dir.path());

        let md_hook = crate::definitions::by_id("mdformat").unwrap();
        let relevant = engine.relevant_files(
            md_hook,
            Some(&[PathBuf::from("app.py"), PathBuf::from("notes.md")]),
        );
        assert_eq!(relevant.len(), 1);
        assert!(relevant[0].ends_with("notes.md"));
    }

    #[tokio::test]
    async fn discovery_skips_hidden_and_cache_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "x = 1\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".venv")).unwrap();
        std::fs::write(dir.path().join(".venv/lib.py"), "y = 2\n").unwrap();
        std::fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        std::fs::write(dir.path().join("__pycache__/c.py"), "z = 3\n").unwrap();

        let engine = make_engine(dir.path());
        let hook = crate::definitions::by_id("ruff-check").unwrap();
        let relevant = engine.relevant_files(hook, None);
        assert_eq!(relevant.len(), 1);
        assert!(relevant[0].ends_with("app.py"));
    }

    #[tokio::test]
    async fn disabled_hooks_are_not_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "x = 1\n").unwrap();

        let executor = Arc::new(SubprocessExecutor::new(
            PathValidator::new(dir.path()).unwrap(),
            Arc::new(SecurityLog::default()),
        ));
        let cache = Arc::new(HookCache::in_memory(Duration::from_secs(3600)));
        let config = HookEngineConfig {
            disabled: crate::definitions::by_category(HookCategory::Fast)
                .iter()
                .map(|h| h.id.to_string())
                .collect(),
            ..Default::default()
        };
        let engine = HookEngine::new(dir.path(), executor, cache, config);

        let results = engine.run_fast(None).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn events_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = flume::unbounded();
        let executor = Arc::new(SubprocessExecutor::new(
            PathValidator::new(dir.path()).unwrap(),
            Arc::new(SecurityLog::default()),
        ));
        let cache = Arc::new(HookCache::in_memory(Duration::from_secs(3600)));
        let engine =
            HookEngine::new(dir.path(), executor, cache, HookEngineConfig::default())
                .with_events(tx);

        let results = engine.run_fast(None).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), results.len());
    }

    #[tokio::test]
    async fn results_keep_schedule_order_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());
        let first: Vec<String> = engine
            .run_fast(None)
            .await
            .into_iter()
            .map(|r| r.hook_id)
            .collect();
        let second: Vec<String> = engine
            .run_fast(None)
            .await
            .into_iter()
            .map(|r| r.hook_id)
            .collect();
        assert_eq!(first, second);
    }
}
