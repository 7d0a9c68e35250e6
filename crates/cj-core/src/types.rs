use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// IssueKind / Severity
// ---------------------------------------------------------------------------

/// Tool-agnostic classification of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Complexity,
    Security,
    Performance,
    Formatting,
    DeadCode,
    TypeError,
    TestFailure,
    Documentation,
    Duplication,
    ImportOrder,
    Dependency,
    CoverageRegression,
    /// Could not be classified. Surfaced in the final report, never routed
    /// to an agent.
    Unknown,
}

impl IssueKind {
    /// Whether the coordinator may hand this kind to a fixing agent.
    pub fn is_routable(&self) -> bool {
        !matches!(self, IssueKind::Unknown)
    }

    pub const ALL: [IssueKind; 13] = [
        IssueKind::Complexity,
        IssueKind::Security,
        IssueKind::Performance,
        IssueKind::Formatting,
        IssueKind::DeadCode,
        IssueKind::TypeError,
        IssueKind::TestFailure,
        IssueKind::Documentation,
        IssueKind::Duplication,
        IssueKind::ImportOrder,
        IssueKind::Dependency,
        IssueKind::CoverageRegression,
        IssueKind::Unknown,
    ];
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IssueKind::Complexity => "complexity",
            IssueKind::Security => "security",
            IssueKind::Performance => "performance",
            IssueKind::Formatting => "formatting",
            IssueKind::DeadCode => "dead_code",
            IssueKind::TypeError => "type_error",
            IssueKind::TestFailure => "test_failure",
            IssueKind::Documentation => "documentation",
            IssueKind::Duplication => "duplication",
            IssueKind::ImportOrder => "import_order",
            IssueKind::Dependency => "dependency",
            IssueKind::CoverageRegression => "coverage_regression",
            IssueKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// A classified problem for an agent to fix. Carries enough context (file,
/// line, tool, raw excerpt) to re-discover the finding on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    /// Id of the tool that produced the diagnostic.
    pub tool: String,
    /// Raw output excerpt the diagnostic was parsed from.
    pub excerpt: Option<String>,
}

impl Issue {
    pub fn new(kind: IssueKind, tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Medium,
            message: message.into(),
            file: None,
            line: None,
            tool: tool.into(),
            excerpt: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = Some(excerpt.into());
        self
    }

    /// Stable key for cross-iteration conflict resolution: kind + location.
    pub fn location_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<none>".into()),
            self.line.unwrap_or(0),
            self.kind,
        )
    }
}

// ---------------------------------------------------------------------------
// HookResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    Passed,
    Failed,
    Error,
    Skipped,
    Cached,
    TimedOut,
}

impl HookStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HookStatus::Passed | HookStatus::Skipped | HookStatus::Cached)
    }
}

impl fmt::Display for HookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HookStatus::Passed => "passed",
            HookStatus::Failed => "failed",
            HookStatus::Error => "error",
            HookStatus::Skipped => "skipped",
            HookStatus::Cached => "cached",
            HookStatus::TimedOut => "timed_out",
        };
        write!(f, "{}", label)
    }
}

/// Output of one external tool invocation. Immutable once produced.
///
/// Invariant: `status == Passed` implies `issues.is_empty()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    pub hook_id: String,
    pub status: HookStatus,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub issues: Vec<Issue>,
    /// Cache key this result was stored (or found) under, when caching
    /// applied.
    pub cache_key: Option<String>,
}

impl HookResult {
    pub fn passed(hook_id: impl Into<String>) -> Self {
        Self {
            hook_id: hook_id.into(),
            status: HookStatus::Passed,
            duration_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            issues: Vec::new(),
            cache_key: None,
        }
    }

    pub fn skipped(hook_id: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Skipped,
            ..Self::passed(hook_id)
        }
    }

    /// Re-tag a cached value so consumers can distinguish a hit from a fresh
    /// run while every other byte stays identical.
    pub fn as_cached(mut self) -> Self {
        self.status = HookStatus::Cached;
        self
    }
}

// ---------------------------------------------------------------------------
// TestResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: u32,
}

impl TestCounts {
    pub fn total(&self) -> u32 {
        self.passed + self.failed + self.skipped + self.errors
    }

    pub fn pass_rate(&self) -> f64 {
        let attempted = self.passed + self.failed + self.errors;
        if attempted == 0 {
            return 1.0;
        }
        f64::from(self.passed) / f64::from(attempted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_id: String,
    pub message: String,
    pub traceback: String,
    /// Flagged by the stuck monitor (exceeded the per-test threshold) rather
    /// than reported by the runner.
    pub stuck: bool,
}

/// The test suite run as a specialized hook.
///
/// Invariant: `counts.total() == passed + failed + skipped + errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub hook: HookResult,
    pub counts: TestCounts,
    pub coverage_percent: Option<f64>,
    pub failures: Vec<TestFailure>,
}

impl TestResult {
    pub fn success(&self) -> bool {
        self.hook.status.is_ok() && self.counts.failed == 0 && self.counts.errors == 0
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// The fixed set of specialized fixing agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    Formatter,
    ImportOrganizer,
    DeadCodeRemover,
    ComplexityReducer,
    SecurityHardener,
    PerformanceOptimizer,
    TestFixer,
    TestCreator,
    DocumentationWriter,
    DuplicationRemover,
    TypeErrorFixer,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentId::Formatter => "formatter",
            AgentId::ImportOrganizer => "import_organizer",
            AgentId::DeadCodeRemover => "dead_code_remover",
            AgentId::ComplexityReducer => "complexity_reducer",
            AgentId::SecurityHardener => "security_hardener",
            AgentId::PerformanceOptimizer => "performance_optimizer",
            AgentId::TestFixer => "test_fixer",
            AgentId::TestCreator => "test_creator",
            AgentId::DocumentationWriter => "documentation_writer",
            AgentId::DuplicationRemover => "duplication_remover",
            AgentId::TypeErrorFixer => "type_error_fixer",
        };
        write!(f, "{}", label)
    }
}

/// Static routing descriptor: which kinds an agent covers and how confident
/// it is for each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub agent: AgentId,
    /// (kind, confidence in [0,1]) pairs; one entry per supported kind.
    pub kinds: Vec<(IssueKind, f64)>,
    /// Can take a batch of issues in one call.
    pub batch: bool,
    /// Coordinates with other agents on overlapping files.
    pub collaborative: bool,
}

impl AgentCapability {
    pub fn confidence_for(&self, kind: IssueKind) -> Option<f64> {
        self.kinds
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, c)| *c)
    }

    pub fn supports(&self, kind: IssueKind) -> bool {
        self.confidence_for(kind).is_some()
    }
}

/// Outcome of one agent attempting one batch of issues.
///
/// Invariant: `success` implies at least one file changed or the issue was
/// verified already-resolved; `!success` implies no partial filesystem state
/// remains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixResult {
    pub agent: AgentId,
    pub success: bool,
    pub issues: Vec<Issue>,
    pub confidence: f64,
    pub files_touched: Vec<PathBuf>,
    pub backups: Vec<Uuid>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl FixResult {
    pub fn failure(agent: AgentId, issues: Vec<Issue>, error: impl Into<String>) -> Self {
        Self {
            agent,
            success: false,
            issues,
            confidence: 0.0,
            files_touched: Vec::new(),
            backups: Vec::new(),
            duration_ms: 0,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A named stage of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    FastHooks,
    Tests,
    ComprehensiveHooks,
    AgentDispatch,
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::FastHooks => "fast_hooks",
            Phase::Tests => "tests",
            Phase::ComprehensiveHooks => "comprehensive_hooks",
            Phase::AgentDispatch => "agent_dispatch",
            Phase::Verify => "verify",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Passed,
    Failed,
    Skipped,
    TimedOut,
}

/// What the CLI (or job-control driver) asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOptions {
    pub run_tests: bool,
    pub ai_fix: bool,
    pub skip_hooks: bool,
    pub test_workers: Option<usize>,
    pub benchmark: bool,
    pub verbose: bool,
    pub max_iterations: u32,
    pub coverage_strict: bool,
    pub dry_run: bool,
    /// Overall wall-clock budget. `None` means unbounded.
    pub deadline: Option<Duration>,
    /// Restrict the test phase to tests matching this pattern.
    pub test_pattern: Option<String>,
    /// Surface low-confidence unfixed issues as a failure instead of
    /// advisory output.
    pub fail_on_unfixed: bool,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            run_tests: false,
            ai_fix: false,
            skip_hooks: false,
            test_workers: None,
            benchmark: false,
            verbose: false,
            max_iterations: 10,
            coverage_strict: true,
            dry_run: false,
            deadline: None,
            test_pattern: None,
            fail_on_unfixed: false,
        }
    }
}

/// Terminal classification of a run. Timeouts and cancellations are
/// distinguished from failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Success,
    /// Issues remain and AI fixing was disabled.
    FailureReport,
    /// The iteration loop stopped without converging.
    PartialFailure,
    /// A phase failed in a way agents cannot address (coverage regression,
    /// test infrastructure error).
    Failure,
    Timeout,
    Cancelled,
    SecurityGate,
}

impl WorkflowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkflowOutcome::Success)
    }

    /// Process exit code contract for the CLI collaborator.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowOutcome::Success => 0,
            WorkflowOutcome::FailureReport => 1,
            WorkflowOutcome::Failure => 2,
            WorkflowOutcome::PartialFailure => 3,
            WorkflowOutcome::Timeout => 4,
            WorkflowOutcome::Cancelled => 5,
            WorkflowOutcome::SecurityGate => 6,
        }
    }
}

/// Per-iteration tallies kept by the orchestrator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub issues_found: usize,
    pub fixes_applied: usize,
    pub fixes_failed: usize,
    pub duration_ms: u64,
}

/// Mutable per-run record, owned exclusively by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub iteration: u32,
    pub iterations: Vec<IterationRecord>,
    pub phases: Vec<(Phase, PhaseStatus)>,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn new(options: &WorkflowOptions) -> Self {
        let started_at = Utc::now();
        let deadline = options
            .deadline
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| started_at + d);
        Self {
            iteration: 0,
            iterations: Vec::new(),
            phases: Vec::new(),
            started_at,
            deadline,
        }
    }

    pub fn record_phase(&mut self, phase: Phase, status: PhaseStatus) {
        self.phases.push((phase, status));
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Utc::now() >= d)
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Aggregate counts offered to the report formatter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationSummary {
    pub fixed_by_kind: BTreeMap<IssueKind, usize>,
    pub remaining_by_kind: BTreeMap<IssueKind, usize>,
    pub low_confidence_unfixed: usize,
}

/// Everything the core returns to its callers. External collaborators format
/// it; the core never renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub outcome: WorkflowOutcome,
    pub iterations: u32,
    pub phases: Vec<(Phase, PhaseStatus)>,
    pub issues: Vec<Issue>,
    pub fixes: Vec<FixResult>,
    pub metrics: Option<QualityMetrics>,
    /// Comparison against the previous stored snapshot, when one existed.
    pub delta: Option<crate::baseline::MetricsComparison>,
    pub summary: RemediationSummary,
    pub total_duration_ms: u64,
}

impl WorkflowResult {
    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }
}

// ---------------------------------------------------------------------------
// QualityMetrics
// ---------------------------------------------------------------------------

/// Per-commit quality snapshot appended to the baseline store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub commit: Option<String>,
    pub coverage_percent: f64,
    pub test_pass_rate: f64,
    pub type_errors: u32,
    pub lint_issues: u32,
    pub complexity_violations: u32,
    pub security_issues: u32,
    pub hook_failures: u32,
    /// Weighted composite in [0,100].
    pub score: f64,
    pub recorded_at: DateTime<Utc>,
}

impl QualityMetrics {
    /// Weighted score: coverage 30%, pass rate 25%, clean-signal 45%.
    ///
    /// The clean-signal share decays with the number of outstanding
    /// findings; fifteen findings zero it out.
    pub fn compute_score(
        coverage_percent: f64,
        test_pass_rate: f64,
        total_findings: u32,
    ) -> f64 {
        let coverage = coverage_percent.clamp(0.0, 100.0);
        let pass_rate = test_pass_rate.clamp(0.0, 1.0) * 100.0;
        let clean = (1.0 - f64::from(total_findings.min(15)) / 15.0) * 100.0;
        (coverage * 0.30 + pass_rate * 0.25 + clean * 0.45).clamp(0.0, 100.0)
    }

    pub fn total_findings(&self) -> u32 {
        self.type_errors
            + self.lint_issues
            + self.complexity_violations
            + self.security_issues
            + self.hook_failures
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
