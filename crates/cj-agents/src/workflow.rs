use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cj_core::baseline::BaselineStore;
use cj_core::cache::HookCache;
use cj_core::config::{Config, ConfigError};
use cj_core::git::GitGateway;
use cj_core::ratchet::CoverageRatchet;
use cj_core::types::{
    FixResult, HookResult, Issue, IssueKind, Phase, PhaseStatus, QualityMetrics,
    RemediationSummary, Severity, TestResult, WorkflowOptions, WorkflowOutcome, WorkflowResult,
    WorkflowState,
};
use cj_guard::events::{SecurityEventKind, SecurityLog};
use cj_guard::file_modifier::SafeFileModifier;
use cj_guard::paths::PathValidator;
use cj_guard::subprocess::SubprocessExecutor;
use cj_hooks::engine::{HookEngine, HookEngineConfig};
use cj_hooks::pytest::{TestExecutor, TestOptions};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{FixContext, FixProposer, NullProposer};
use crate::classify::{classify_hook_result, classify_test_result};
use crate::coordinator::{
    AgentCoordinator, CoordinatorConfig, DispatchReport, FixVerifier, TrustingVerifier,
};
use crate::jobs::JobEvent;
use crate::registry::AgentRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal pre-flight failures. Everything after phase one flows through the
/// typed result instead.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("project root does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("configuration unreadable: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path validation failed: {0}")]
    Path(#[from] cj_guard::paths::PathError),
    #[error(transparent)]
    Ratchet(#[from] cj_core::ratchet::RatchetError),
    #[error(transparent)]
    Baseline(#[from] cj_core::baseline::BaselineError),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The single workflow state machine: fast hooks → tests → comprehensive
/// hooks → classify → dispatch → verify, iterated to convergence or budget.
pub struct WorkflowEngine {
    root: PathBuf,
    cache_dir: PathBuf,
    config: Config,
    cache: Arc<HookCache>,
    hooks: Arc<HookEngine>,
    tests: TestExecutor,
    coordinator: AgentCoordinator,
    modifier: SafeFileModifier,
    proposer: Arc<dyn FixProposer>,
    ratchet: tokio::sync::Mutex<CoverageRatchet>,
    baseline: BaselineStore,
    git: GitGateway,
    security_log: Arc<SecurityLog>,
    events: Option<flume::Sender<JobEvent>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("root", &self.root)
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Build an engine for the project at `root`. Fatal when the root is
    /// missing or the config cannot be read.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WorkflowError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(WorkflowError::MissingRoot(root));
        }
        let config = Config::load(&root)?;
        let security_log = Arc::new(SecurityLog::default());

        let validator = PathValidator::new(&root)?;
        let executor = Arc::new(SubprocessExecutor::new(
            validator.clone(),
            Arc::clone(&security_log),
        ));

        let cache_dir = config.cache_dir(&root);
        let cache = Arc::new(HookCache::new(
            config.cache.max_entries,
            Duration::from_secs(config.cache.ttl_secs),
            Some(cache_dir.clone()),
        ));

        let hooks = Arc::new(HookEngine::new(
            &root,
            Arc::clone(&executor),
            Arc::clone(&cache),
            HookEngineConfig::from_config(&config.hooks),
        ));
        let tests = TestExecutor::new(&root, Arc::clone(&executor));
        let coordinator = AgentCoordinator::new(
            Arc::new(AgentRegistry::new()),
            CoordinatorConfig::from_config(&config.agents),
        );
        let modifier = SafeFileModifier::new(validator, Arc::clone(&security_log));
        let ratchet = tokio::sync::Mutex::new(CoverageRatchet::open(&cache_dir)?);
        let baseline = BaselineStore::open(&cache_dir)?;
        let git = GitGateway::new(
            &root,
            SubprocessExecutor::new(PathValidator::new(&root)?, Arc::clone(&security_log)),
        );

        Ok(Self {
            root,
            cache_dir,
            config,
            cache,
            hooks,
            tests,
            coordinator,
            modifier,
            proposer: Arc::new(NullProposer),
            ratchet,
            baseline,
            git,
            security_log,
            events: None,
            cancel: None,
        })
    }

    /// Inject the external fix proposer.
    pub fn with_proposer(mut self, proposer: Arc<dyn FixProposer>) -> Self {
        self.proposer = proposer;
        self
    }

    /// Attach the job-control event channel.
    pub fn with_events(mut self, events: flume::Sender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach a cancellation signal, checked at phase boundaries and
    /// propagated into the test runner so in-flight sessions terminate.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.tests = self.tests.with_cancel(cancel.clone());
        self.cancel = Some(cancel);
        self
    }

    /// Override the test runner binary (tests substitute a stub).
    pub fn with_test_runner(mut self, runner: impl Into<String>) -> Self {
        self.tests = self.tests.with_runner(runner);
        self
    }

    pub fn security_log(&self) -> &Arc<SecurityLog> {
        &self.security_log
    }

    // -----------------------------------------------------------------------
    // The run loop
    // -----------------------------------------------------------------------

    pub async fn run(&self, options: WorkflowOptions) -> Result<WorkflowResult, WorkflowError> {
        let mut state = WorkflowState::new(&options);
        let mut all_fixes: Vec<FixResult> = Vec::new();
        let mut low_confidence_total = 0usize;
        let mut final_issues: Vec<Issue> = Vec::new();
        let mut last_test: Option<TestResult> = None;
        let mut hook_failures_last = 0u32;

        info!(
            root = %self.root.display(),
            max_iterations = options.max_iterations,
            ai_fix = options.ai_fix,
            "workflow started"
        );

        let outcome = 'run: loop {
            state.iteration += 1;
            let iteration_started = std::time::Instant::now();
            let mut issues: Vec<Issue> = Vec::new();
            let mut hook_failures = 0u32;

            // ---- fast hooks (retried once to absorb auto-format churn) ----
            if !options.skip_hooks {
                if let Some(stop) = self.gate(&state) {
                    break 'run stop;
                }
                self.emit_phase(Phase::FastHooks, 0.1, "running");
                let mut fast = self.hooks.run_fast(None).await;
                if fast.iter().any(|r| !r.status.is_ok()) {
                    info!("fast hooks failed, retrying once");
                    fast = self.hooks.run_fast(None).await;
                }
                hook_failures += count_failures(&fast);
                let status = phase_status(&fast);
                state.record_phase(Phase::FastHooks, status);
                self.emit_hooks(&fast, Phase::FastHooks, 0.2);
                issues.extend(fast.iter().flat_map(classify_hook_result));
            }

            // ---- tests (skipped entirely when skip_hooks is set) ----------
            if options.run_tests && !options.skip_hooks {
                if let Some(stop) = self.gate(&state) {
                    break 'run stop;
                }
                self.emit_phase(Phase::Tests, 0.35, "running");
                let test_options = TestOptions {
                    workers: options.test_workers.unwrap_or(self.config.tests.workers),
                    benchmark: options.benchmark,
                    timeout: Duration::from_secs(self.config.tests.session_timeout_secs),
                    stuck_threshold: Duration::from_secs(self.config.tests.stuck_threshold_secs),
                    pattern: options.test_pattern.clone(),
                    path: self.config.tests.path.clone(),
                    verbose: options.verbose,
                    ..Default::default()
                };
                let result = self.tests.run(&test_options, None).await;
                state.record_phase(
                    Phase::Tests,
                    if result.success() {
                        PhaseStatus::Passed
                    } else {
                        PhaseStatus::Failed
                    },
                );
                self.emit_phase(
                    Phase::Tests,
                    0.45,
                    if result.success() { "passed" } else { "failed" },
                );
                issues.extend(classify_test_result(&result));

                // Ratchet the coverage floor.
                if let Some(coverage) = result.coverage_percent {
                    let mut ratchet = self.ratchet.lock().await;
                    let ratchet_result = ratchet.update(coverage)?;
                    if ratchet_result.regression {
                        let baseline = ratchet_result.baseline;
                        let issue = Issue::new(
                            IssueKind::CoverageRegression,
                            "coverage",
                            format!("coverage {coverage:.2}% fell below baseline {baseline:.2}%"),
                        )
                        .with_severity(Severity::Critical);
                        if options.coverage_strict {
                            warn!(coverage, baseline, "coverage regression is fatal");
                            final_issues = issues;
                            final_issues.push(issue);
                            last_test = Some(result);
                            break 'run WorkflowOutcome::Failure;
                        }
                        issues.push(issue);
                    } else if ratchet_result.improved {
                        // The project's declared floor follows the ratchet.
                        let _ = ratchet.write_back_threshold(&self.root.join("pyproject.toml"));
                    }
                }
                last_test = Some(result);
            }

            // ---- comprehensive hooks --------------------------------------
            if let Some(stop) = self.gate(&state) {
                break 'run stop;
            }
            self.emit_phase(Phase::ComprehensiveHooks, 0.55, "running");
            let comprehensive = self.hooks.run_comprehensive(None).await;
            hook_failures += count_failures(&comprehensive);
            state.record_phase(Phase::ComprehensiveHooks, phase_status(&comprehensive));
            self.emit_hooks(&comprehensive, Phase::ComprehensiveHooks, 0.7);
            issues.extend(comprehensive.iter().flat_map(classify_hook_result));

            hook_failures_last = hook_failures;

            // ---- convergence check ----------------------------------------
            if issues.is_empty() {
                info!(iteration = state.iteration, "converged, no issues");
                record_iteration(&mut state, iteration_started, 0, 0, 0);
                break 'run WorkflowOutcome::Success;
            }

            if !options.ai_fix {
                final_issues = issues;
                record_iteration(&mut state, iteration_started, final_issues.len(), 0, 0);
                break 'run WorkflowOutcome::FailureReport;
            }

            // ---- agent dispatch + verification ----------------------------
            if let Some(stop) = self.gate(&state) {
                break 'run stop;
            }
            self.emit_phase(Phase::AgentDispatch, 0.75, "running");
            let report = self.dispatch(&options, &issues).await;
            let successful = report.successful_fixes();
            let failed = report.fixes.len() - successful;
            low_confidence_total = report.low_confidence.len();
            record_iteration(
                &mut state,
                iteration_started,
                issues.len(),
                successful,
                failed,
            );
            state.record_phase(
                Phase::AgentDispatch,
                if successful > 0 {
                    PhaseStatus::Passed
                } else {
                    PhaseStatus::Failed
                },
            );
            self.emit_phase(Phase::Verify, 0.9, "verifying");

            if report.cancelled {
                final_issues = issues;
                all_fixes.extend(report.fixes);
                break 'run WorkflowOutcome::Cancelled;
            }

            // Repeated security-gate failures abort the run.
            if self.security_log.count(SecurityEventKind::RateLimited) > 0 {
                final_issues = issues;
                all_fixes.extend(report.fixes);
                break 'run WorkflowOutcome::SecurityGate;
            }

            let only_advisory_left = successful > 0
                && report.fixes.iter().all(|f| f.success)
                && report.deferred.is_empty()
                && report.unrouted.is_empty()
                && !report.low_confidence.is_empty();

            all_fixes.extend(report.fixes);

            if successful == 0 {
                // No-progress iteration: agents achieved nothing against a
                // non-empty issue set.
                warn!(iteration = state.iteration, "no progress, stopping early");
                final_issues = issues;
                break 'run WorkflowOutcome::PartialFailure;
            }

            // Low-confidence leftovers are advisory unless the caller made
            // them blocking.
            if only_advisory_left && !options.fail_on_unfixed {
                final_issues = [report.low_confidence, report.unrouted].concat();
                break 'run WorkflowOutcome::Success;
            }

            if state.iteration >= options.max_iterations {
                // One more check at the budget edge: the next loop entry
                // would re-run the phases, but the budget is spent.
                final_issues = issues;
                break 'run WorkflowOutcome::PartialFailure;
            }
        };

        let metrics = self.snapshot_metrics(&final_issues, &last_test, hook_failures_last).await;
        // Diff against the previous snapshot before this run is appended.
        let delta = match (&metrics, self.baseline.is_empty()) {
            (Some(current), false) => Some(self.baseline.compare(current, None)),
            _ => None,
        };
        if let Some(metrics) = &metrics {
            if let Err(e) = self.baseline.append(metrics.clone()) {
                warn!(error = %e, "baseline append failed");
            }
        }
        self.persist_state(&state);

        // End-of-run sweep keeps both cache tiers from accreting expired
        // entries across long-lived processes.
        let cache = Arc::clone(&self.cache);
        let swept = tokio::task::spawn_blocking(move || cache.sweep())
            .await
            .unwrap_or(0);
        if swept > 0 {
            info!(swept, "expired cache entries purged");
        }

        let summary = build_summary(&all_fixes, &final_issues, low_confidence_total);
        self.emit_phase(Phase::Verify, 1.0, "done");

        info!(outcome = ?outcome, iterations = state.iteration, "workflow finished");
        Ok(WorkflowResult {
            outcome,
            iterations: state.iteration,
            phases: state.phases.clone(),
            issues: final_issues,
            fixes: all_fixes,
            metrics,
            delta,
            summary,
            total_duration_ms: state.elapsed_ms(),
        })
    }

    /// Best-effort record of the finished run's state next to the caches.
    fn persist_state(&self, state: &WorkflowState) {
        let _ = std::fs::create_dir_all(&self.cache_dir);
        let path = self.cache_dir.join("last-run.json");
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(path = %path.display(), error = %e, "state persistence failed");
                }
            }
            Err(e) => warn!(error = %e, "state serialization failed"),
        }
    }

    /// Deadline and cancellation are both checked before every phase.
    fn gate(&self, state: &WorkflowState) -> Option<WorkflowOutcome> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|rx| *rx.borrow())
        {
            return Some(WorkflowOutcome::Cancelled);
        }
        if state.deadline_exceeded() {
            return Some(WorkflowOutcome::Timeout);
        }
        None
    }

    async fn dispatch(&self, options: &WorkflowOptions, issues: &[Issue]) -> DispatchReport {
        let ctx = FixContext {
            root: &self.root,
            modifier: &self.modifier,
            proposer: self.proposer.as_ref(),
            dry_run: options.dry_run,
        };
        if options.dry_run {
            // Nothing was written, so there is nothing to re-check.
            return self
                .coordinator
                .handle(&ctx, issues, &TrustingVerifier, self.cancel.as_ref())
                .await;
        }
        let verifier = EngineVerifier {
            hooks: Arc::clone(&self.hooks),
            tests: &self.tests,
        };
        self.coordinator
            .handle(&ctx, issues, &verifier, self.cancel.as_ref())
            .await
    }

    async fn snapshot_metrics(
        &self,
        issues: &[Issue],
        last_test: &Option<TestResult>,
        hook_failures: u32,
    ) -> Option<QualityMetrics> {
        let commit = if self.git.is_repo().await {
            self.git.head_commit().await.ok()
        } else {
            None
        };

        let coverage = match last_test.as_ref().and_then(|t| t.coverage_percent) {
            Some(coverage) => coverage,
            None => self.ratchet.lock().await.baseline().unwrap_or(0.0),
        };
        let pass_rate = last_test
            .as_ref()
            .map(|t| t.counts.pass_rate())
            .unwrap_or(1.0);

        let count = |kind: IssueKind| issues.iter().filter(|i| i.kind == kind).count() as u32;
        let type_errors = count(IssueKind::TypeError);
        let lint_issues = count(IssueKind::Formatting) + count(IssueKind::ImportOrder);
        let complexity_violations = count(IssueKind::Complexity);
        let security_issues = count(IssueKind::Security);

        let total = type_errors + lint_issues + complexity_violations + security_issues + hook_failures;
        Some(QualityMetrics {
            commit,
            coverage_percent: coverage,
            test_pass_rate: pass_rate,
            type_errors,
            lint_issues,
            complexity_violations,
            security_issues,
            hook_failures,
            score: QualityMetrics::compute_score(coverage, pass_rate, total),
            recorded_at: Utc::now(),
        })
    }

    fn emit_phase(&self, phase: Phase, progress: f64, status: &str) {
        if let Some(events) = &self.events {
            let _ = events.try_send(JobEvent {
                job_id: None,
                phase: phase.to_string(),
                progress,
                status: status.to_string(),
                details: BTreeMap::new(),
            });
        }
    }

    fn emit_hooks(&self, results: &[HookResult], phase: Phase, progress: f64) {
        if let Some(events) = &self.events {
            for result in results {
                let mut details = BTreeMap::new();
                details.insert("hook".to_string(), result.hook_id.clone());
                details.insert("duration_ms".to_string(), result.duration_ms.to_string());
                let _ = events.try_send(JobEvent {
                    job_id: None,
                    phase: phase.to_string(),
                    progress,
                    status: result.status.to_string(),
                    details,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Verification against the real engines
// ---------------------------------------------------------------------------

struct EngineVerifier<'a> {
    hooks: Arc<HookEngine>,
    tests: &'a TestExecutor,
}

#[async_trait]
impl FixVerifier for EngineVerifier<'_> {
    async fn verify_fixed(&self, tool: &str, files: &[PathBuf]) -> bool {
        if tool == "pytest" {
            // Scope the re-run to the touched test files when there are any.
            let path = files
                .iter()
                .find(|f| f.to_string_lossy().contains("test"))
                .cloned();
            let options = TestOptions {
                path,
                ..Default::default()
            };
            return self.tests.run(&options, None).await.success();
        }
        match self.hooks.run_one(tool, Some(files)).await {
            Some(result) => result.status.is_ok(),
            // Issues from non-hook sources (the engine itself, the ratchet)
            // cannot be re-checked tool-by-tool.
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn count_failures(results: &[HookResult]) -> u32 {
    results.iter().filter(|r| !r.status.is_ok()).count() as u32
}

fn phase_status(results: &[HookResult]) -> PhaseStatus {
    if results
        .iter()
        .any(|r| r.status == cj_core::types::HookStatus::TimedOut)
    {
        PhaseStatus::TimedOut
    } else if results.iter().all(|r| r.status.is_ok()) {
        PhaseStatus::Passed
    } else {
        PhaseStatus::Failed
    }
}

fn record_iteration(
    state: &mut WorkflowState,
    started: std::time::Instant,
    issues_found: usize,
    fixes_applied: usize,
    fixes_failed: usize,
) {
    state.iterations.push(cj_core::types::IterationRecord {
        iteration: state.iteration,
        issues_found,
        fixes_applied,
        fixes_failed,
        duration_ms: started.elapsed().as_millis() as u64,
    });
}

fn build_summary(
    fixes: &[FixResult],
    remaining: &[Issue],
    low_confidence: usize,
) -> RemediationSummary {
    let mut summary = RemediationSummary {
        low_confidence_unfixed: low_confidence,
        ..Default::default()
    };
    for fix in fixes.iter().filter(|f| f.success) {
        for issue in &fix.issues {
            *summary.fixed_by_kind.entry(issue.kind).or_default() += 1;
        }
    }
    for issue in remaining {
        *summary.remaining_by_kind.entry(issue.kind).or_default() += 1;
    }
    summary
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-pytest");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn missing_root_is_fatal() {
        let err = WorkflowEngine::new("/definitely/not/a/real/path/xyz").unwrap_err();
        assert!(matches!(err, WorkflowError::MissingRoot(_)));
    }

    #[test]
    fn unreadable_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("crackerjack.toml"), "[broken").unwrap();
        let err = WorkflowEngine::new(dir.path()).unwrap_err();
        assert!(matches!(err, WorkflowError::Config(_)));
    }

    #[tokio::test]
    async fn clean_tree_converges_first_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WorkflowEngine::new(dir.path()).unwrap();

        let result = engine.run(WorkflowOptions::default()).await.unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::Success);
        assert_eq!(result.iterations, 1);
        assert!(result.issues.is_empty());
        assert!(result.fixes.is_empty());
    }

    #[tokio::test]
    async fn issues_without_ai_fix_report_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A python file forces hook invocations; the tools are not
        // installed, which surfaces dependency issues.
        std::fs::write(dir.path().join("app.py"), "x = 1\n").unwrap();
        let engine = WorkflowEngine::new(dir.path()).unwrap();

        let result = engine.run(WorkflowOptions::default()).await.unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::FailureReport);
        assert!(!result.issues.is_empty());
        assert!(result
            .issues
            .iter()
            .all(|i| i.kind == IssueKind::Dependency));
    }

    #[tokio::test]
    async fn unroutable_issues_with_ai_fix_stop_on_no_progress() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "x = 1\n").unwrap();
        let engine = WorkflowEngine::new(dir.path()).unwrap();

        let options = WorkflowOptions {
            ai_fix: true,
            max_iterations: 3,
            ..Default::default()
        };
        let result = engine.run(options).await.unwrap();
        // Dependency issues have no agent: zero successful fixes ends the
        // loop after the first iteration.
        assert_eq!(result.outcome, WorkflowOutcome::PartialFailure);
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn deadline_yields_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WorkflowEngine::new(dir.path()).unwrap();

        let options = WorkflowOptions {
            deadline: Some(Duration::ZERO),
            ..Default::default()
        };
        let result = engine.run(options).await.unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::Timeout);
    }

    #[tokio::test]
    async fn cancellation_yields_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(true);
        let engine = WorkflowEngine::new(dir.path()).unwrap().with_cancel(rx);

        let result = engine.run(WorkflowOptions::default()).await.unwrap();
        drop(tx);
        assert_eq!(result.outcome, WorkflowOutcome::Cancelled);
    }

    #[tokio::test]
    async fn skip_hooks_skips_fast_and_tests() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WorkflowEngine::new(dir.path()).unwrap();

        let options = WorkflowOptions {
            skip_hooks: true,
            run_tests: true,
            ..Default::default()
        };
        let result = engine.run(options).await.unwrap();
        assert!(result
            .phases
            .iter()
            .all(|(phase, _)| *phase == Phase::ComprehensiveHooks));
        assert_eq!(result.outcome, WorkflowOutcome::Success);
    }

    #[tokio::test]
    async fn coverage_regression_fails_strict_run() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo "collected 1 items"
echo "tests/test_a.py::test_one PASSED [100%]"
echo "TOTAL    100    20    80%"
echo "= 1 passed in 0.01s ="
exit 0
"#,
        );

        // Seed the ratchet with a higher baseline.
        let cache_dir = dir.path().join(".crackerjack").join("cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        let mut ratchet = CoverageRatchet::open(&cache_dir).unwrap();
        ratchet.update(85.0).unwrap();

        let engine = WorkflowEngine::new(dir.path())
            .unwrap()
            .with_test_runner(stub.display().to_string());
        let options = WorkflowOptions {
            run_tests: true,
            coverage_strict: true,
            ..Default::default()
        };
        let result = engine.run(options).await.unwrap();

        assert_eq!(result.outcome, WorkflowOutcome::Failure);
        assert!(result
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::CoverageRegression));

        // The baseline must be unchanged.
        let ratchet = CoverageRatchet::open(&cache_dir).unwrap();
        assert_eq!(ratchet.baseline(), Some(85.0));
    }

    #[tokio::test]
    async fn coverage_improvement_advances_ratchet_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[tool.coverage.report]\nfail_under = 40\n",
        )
        .unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo "collected 1 items"
echo "tests/test_a.py::test_one PASSED [100%]"
echo "TOTAL    100    10    90%"
echo "= 1 passed in 0.01s ="
exit 0
"#,
        );

        let cache_dir = dir.path().join(".crackerjack").join("cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        CoverageRatchet::open(&cache_dir).unwrap();

        let engine = WorkflowEngine::new(dir.path())
            .unwrap()
            .with_test_runner(stub.display().to_string());
        let options = WorkflowOptions {
            run_tests: true,
            ..Default::default()
        };
        let result = engine.run(options).await.unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::Success);

        let ratchet = CoverageRatchet::open(&cache_dir).unwrap();
        assert_eq!(ratchet.baseline(), Some(90.0));
        let manifest = std::fs::read_to_string(dir.path().join("pyproject.toml")).unwrap();
        assert!(manifest.contains("fail_under = 90"));
    }

    #[tokio::test]
    async fn metrics_are_recorded_to_baseline_store() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WorkflowEngine::new(dir.path()).unwrap();
        let result = engine.run(WorkflowOptions::default()).await.unwrap();
        assert!(result.metrics.is_some());

        let store = BaselineStore::open(dir.path().join(".crackerjack").join("cache")).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn phase_events_are_emitted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = flume::unbounded();
        let engine = WorkflowEngine::new(dir.path()).unwrap().with_events(tx);

        let _ = engine.run(WorkflowOptions::default()).await.unwrap();
        let events: Vec<JobEvent> = rx.drain().collect();
        assert!(!events.is_empty());
        assert_eq!(events[0].phase, Phase::FastHooks.to_string());
        assert_eq!(events.last().unwrap().progress, 1.0);
    }

    #[tokio::test]
    async fn second_run_on_unchanged_tree_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WorkflowEngine::new(dir.path()).unwrap();

        let first = engine.run(WorkflowOptions::default()).await.unwrap();
        let second = engine.run(WorkflowOptions::default()).await.unwrap();
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.issues, second.issues);
        assert!(second.fixes.is_empty());
    }
}
