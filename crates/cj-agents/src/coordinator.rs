use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cj_core::config::AgentsConfig;
use cj_core::types::{FixResult, Issue, IssueKind};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::agent::FixContext;
use crate::registry::AgentRegistry;

// ---------------------------------------------------------------------------
// FixVerifier
// ---------------------------------------------------------------------------

/// Re-checks a claimed fix by re-running the originating tool, scoped to the
/// touched files. The workflow wires this to the hook engine; tests stub it.
#[async_trait]
pub trait FixVerifier: Send + Sync {
    /// `true` when the tool that produced the issue now comes back clean
    /// over `files`.
    async fn verify_fixed(&self, tool: &str, files: &[PathBuf]) -> bool;
}

/// Trusts every fix. Used when verification is structurally impossible
/// (dry runs) and in unit tests.
pub struct TrustingVerifier;

#[async_trait]
impl FixVerifier for TrustingVerifier {
    async fn verify_fixed(&self, _tool: &str, _files: &[PathBuf]) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Config / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Dispatch gate: agents below this confidence are not invoked, and
    /// results below it are never counted as success. The boundary value
    /// itself dispatches.
    pub confidence_threshold: f64,
    pub max_concurrent: usize,
    pub agent_timeout: Duration,
}

impl CoordinatorConfig {
    pub fn from_config(config: &AgentsConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            max_concurrent: config.max_concurrent.max(1),
            agent_timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_config(&AgentsConfig::default())
    }
}

/// Everything one dispatch round produced.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub fixes: Vec<FixResult>,
    /// Issues whose best agent sat below the confidence threshold.
    pub low_confidence: Vec<Issue>,
    /// Issues no agent covers (includes every `Unknown`).
    pub unrouted: Vec<Issue>,
    /// Cross-cutting issues that lost their location to a higher-confidence
    /// agent this round; they stay for the next iteration.
    pub deferred: Vec<Issue>,
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn successful_fixes(&self) -> usize {
        self.fixes.iter().filter(|f| f.success).count()
    }
}

// ---------------------------------------------------------------------------
// AgentCoordinator
// ---------------------------------------------------------------------------

/// Groups issues by kind, routes each group to the highest-confidence
/// capable agent, dispatches in two waves (formatters last), verifies
/// claimed fixes, and enforces the confidence gate.
pub struct AgentCoordinator {
    registry: Arc<AgentRegistry>,
    config: CoordinatorConfig,
}

/// Kinds handled by normalizing agents; they run in the trailing wave so
/// they clean up after every substantive fix.
const TRAILING_WAVE: [IssueKind; 2] = [IssueKind::Formatting, IssueKind::ImportOrder];

impl AgentCoordinator {
    pub fn new(registry: Arc<AgentRegistry>, config: CoordinatorConfig) -> Self {
        Self { registry, config }
    }

    pub async fn handle(
        &self,
        ctx: &FixContext<'_>,
        issues: &[Issue],
        verifier: &dyn FixVerifier,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        // 1. Group by kind; unroutable kinds fall straight into the report.
        let mut groups: BTreeMap<IssueKind, Vec<Issue>> = BTreeMap::new();
        for issue in issues {
            if issue.kind.is_routable() {
                groups.entry(issue.kind).or_default().push(issue.clone());
            } else {
                report.unrouted.push(issue.clone());
            }
        }

        // 2. Resolve each group to an agent, applying the confidence gate.
        let mut assignments: BTreeMap<IssueKind, (f64, Vec<Issue>)> = BTreeMap::new();
        for (kind, group) in groups {
            match self.registry.best_for(kind) {
                None => report.unrouted.extend(group),
                Some((_, confidence)) if confidence < self.config.confidence_threshold => {
                    debug!(%kind, confidence, "below confidence threshold, not dispatching");
                    report.low_confidence.extend(group);
                }
                Some((_, confidence)) => {
                    assignments.insert(kind, (confidence, group));
                }
            }
        }

        // 3. Cross-cutting conflicts: one location, multiple kinds — only
        // the highest-confidence assignment keeps it this round.
        resolve_cross_cutting(&mut assignments, &mut report.deferred);

        // 4. Two-tier wave execution with a barrier between the waves.
        let (leading, trailing): (Vec<_>, Vec<_>) = assignments
            .into_iter()
            .partition(|(kind, _)| !TRAILING_WAVE.contains(kind));

        info!(
            leading = leading.len(),
            trailing = trailing.len(),
            "dispatching agent waves"
        );

        for wave in [leading, trailing] {
            if is_cancelled(cancel) {
                report.cancelled = true;
                break;
            }
            let wave_fixes = self.dispatch_wave(ctx, wave, cancel).await;
            report.fixes.extend(wave_fixes);
        }

        // 5. Confidence gate on results, then verification of survivors.
        for fix in &mut report.fixes {
            if fix.success && fix.confidence < self.config.confidence_threshold {
                warn!(agent = %fix.agent, confidence = fix.confidence, "fix rejected by confidence gate");
                fix.success = false;
                fix.error = Some(format!(
                    "confidence {:.2} below threshold {:.2}",
                    fix.confidence, self.config.confidence_threshold
                ));
            }
        }
        self.verify_fixes(&mut report.fixes, verifier).await;

        report
    }

    async fn dispatch_wave(
        &self,
        ctx: &FixContext<'_>,
        wave: Vec<(IssueKind, (f64, Vec<Issue>))>,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Vec<FixResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let timeout = self.config.agent_timeout;

        let tasks = wave.into_iter().filter_map(|(kind, (_, group))| {
            if is_cancelled(cancel) {
                return None;
            }
            let (agent, _) = self.registry.best_for(kind)?;
            let semaphore = Arc::clone(&semaphore);
            Some(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                match tokio::time::timeout(timeout, agent.propose_and_apply(ctx, &group)).await {
                    Ok(fix) => fix,
                    Err(_) => {
                        warn!(agent = %agent.id(), timeout_secs = timeout.as_secs(), "agent timed out");
                        FixResult::failure(
                            agent.id(),
                            group,
                            format!("agent timed out after {}s", timeout.as_secs()),
                        )
                    }
                }
            })
        });

        futures::future::join_all(tasks).await
    }

    /// Re-run each originating tool over the touched files; a still-failing
    /// tool downgrades the fix.
    async fn verify_fixes(&self, fixes: &mut [FixResult], verifier: &dyn FixVerifier) {
        for fix in fixes.iter_mut() {
            if !fix.success || fix.files_touched.is_empty() {
                continue;
            }
            let mut tools: Vec<&str> = fix.issues.iter().map(|i| i.tool.as_str()).collect();
            tools.sort();
            tools.dedup();
            for tool in tools {
                if !verifier.verify_fixed(tool, &fix.files_touched).await {
                    warn!(agent = %fix.agent, tool, "verification failed, downgrading fix");
                    fix.success = false;
                    fix.error = Some(format!("`{tool}` still fails after fix"));
                    break;
                }
            }
        }
    }
}

fn is_cancelled(cancel: Option<&watch::Receiver<bool>>) -> bool {
    cancel.is_some_and(|rx| *rx.borrow())
}

/// Strip conflicting (file, line) locations down to the single
/// highest-confidence kind; losers move to `deferred`.
fn resolve_cross_cutting(
    assignments: &mut BTreeMap<IssueKind, (f64, Vec<Issue>)>,
    deferred: &mut Vec<Issue>,
) {
    // location -> (confidence, kind) winner
    let mut winners: BTreeMap<(PathBuf, u32), (f64, IssueKind)> = BTreeMap::new();
    for (kind, (confidence, group)) in assignments.iter() {
        for issue in group {
            let (Some(file), Some(line)) = (&issue.file, issue.line) else {
                continue;
            };
            let key = (file.clone(), line);
            match winners.get(&key) {
                Some((best, _)) if *best >= *confidence => {}
                _ => {
                    winners.insert(key, (*confidence, *kind));
                }
            }
        }
    }

    for (kind, (_, group)) in assignments.iter_mut() {
        let mut kept = Vec::with_capacity(group.len());
        for issue in group.drain(..) {
            let conflict_loser = match (&issue.file, issue.line) {
                (Some(file), Some(line)) => winners
                    .get(&(file.clone(), line))
                    .is_some_and(|(_, winner)| winner != kind),
                _ => false,
            };
            if conflict_loser {
                deferred.push(issue);
            } else {
                kept.push(issue);
            }
        }
        *group = kept;
    }
    assignments.retain(|_, (_, group)| !group.is_empty());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{FixAgent, NullProposer};
    use cj_core::types::{AgentCapability, AgentId};
    use cj_guard::events::SecurityLog;
    use cj_guard::file_modifier::SafeFileModifier;
    use cj_guard::paths::PathValidator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // -- Stub agent -------------------------------------------------------

    struct StubAgent {
        id: AgentId,
        kinds: Vec<(IssueKind, f64)>,
        succeed: bool,
        confidence: f64,
        calls: Arc<AtomicUsize>,
        order_log: Option<Arc<std::sync::Mutex<Vec<AgentId>>>>,
    }

    impl StubAgent {
        fn new(id: AgentId, kind: IssueKind, confidence: f64) -> Self {
            Self {
                id,
                kinds: vec![(kind, confidence)],
                succeed: true,
                confidence,
                calls: Arc::new(AtomicUsize::new(0)),
                order_log: None,
            }
        }
    }

    #[async_trait]
    impl FixAgent for StubAgent {
        fn id(&self) -> AgentId {
            self.id
        }

        fn capability(&self) -> AgentCapability {
            AgentCapability {
                agent: self.id,
                kinds: self.kinds.clone(),
                batch: true,
                collaborative: false,
            }
        }

        async fn propose_and_apply(&self, _ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.order_log {
                log.lock().unwrap().push(self.id);
            }
            FixResult {
                agent: self.id,
                success: self.succeed,
                issues: issues.to_vec(),
                confidence: self.confidence,
                files_touched: if self.succeed {
                    vec![PathBuf::from("a.py")]
                } else {
                    Vec::new()
                },
                backups: Vec::new(),
                duration_ms: 1,
                error: None,
            }
        }
    }

    struct RejectingVerifier;

    #[async_trait]
    impl FixVerifier for RejectingVerifier {
        async fn verify_fixed(&self, _tool: &str, _files: &[PathBuf]) -> bool {
            false
        }
    }

    fn ctx_parts(root: &std::path::Path) -> SafeFileModifier {
        SafeFileModifier::new(
            PathValidator::new(root).unwrap(),
            Arc::new(SecurityLog::default()),
        )
    }

    fn issue(kind: IssueKind, file: &str, line: u32) -> Issue {
        Issue::new(kind, "some-tool", "finding")
            .with_file(file)
            .with_line(line)
    }

    fn coordinator(agents: Vec<Arc<dyn FixAgent>>) -> AgentCoordinator {
        AgentCoordinator::new(
            Arc::new(AgentRegistry::with_agents(agents)),
            CoordinatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn routes_to_highest_confidence_agent() {
        let weak = Arc::new(StubAgent::new(AgentId::Formatter, IssueKind::Formatting, 0.75));
        let strong = Arc::new(StubAgent::new(
            AgentId::ImportOrganizer,
            IssueKind::Formatting,
            0.95,
        ));
        let weak_calls = Arc::clone(&weak.calls);
        let strong_calls = Arc::clone(&strong.calls);

        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let ctx = FixContext {
            root: dir.path(),
            modifier: &modifier,
            proposer: &NullProposer,
            dry_run: false,
        };

        let report = coordinator(vec![weak, strong])
            .handle(
                &ctx,
                &[issue(IssueKind::Formatting, "a.py", 1)],
                &TrustingVerifier,
                None,
            )
            .await;

        assert_eq!(report.successful_fixes(), 1);
        assert_eq!(weak_calls.load(Ordering::SeqCst), 0);
        assert_eq!(strong_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn below_threshold_is_not_dispatched() {
        let agent = Arc::new(StubAgent::new(AgentId::TypeErrorFixer, IssueKind::TypeError, 0.5));
        let calls = Arc::clone(&agent.calls);

        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let ctx = FixContext {
            root: dir.path(),
            modifier: &modifier,
            proposer: &NullProposer,
            dry_run: false,
        };

        let report = coordinator(vec![agent])
            .handle(
                &ctx,
                &[issue(IssueKind::TypeError, "a.py", 3)],
                &TrustingVerifier,
                None,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.low_confidence.len(), 1);
        assert!(report.fixes.is_empty());
    }

    #[tokio::test]
    async fn exactly_at_threshold_dispatches() {
        let agent = Arc::new(StubAgent::new(
            AgentId::DuplicationRemover,
            IssueKind::Duplication,
            0.7,
        ));
        let calls = Arc::clone(&agent.calls);

        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let ctx = FixContext {
            root: dir.path(),
            modifier: &modifier,
            proposer: &NullProposer,
            dry_run: false,
        };

        let report = coordinator(vec![agent])
            .handle(
                &ctx,
                &[issue(IssueKind::Duplication, "a.py", 8)],
                &TrustingVerifier,
                None,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(report.low_confidence.is_empty());
        assert_eq!(report.successful_fixes(), 1);
    }

    #[tokio::test]
    async fn unknown_issues_are_reported_not_routed() {
        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let ctx = FixContext {
            root: dir.path(),
            modifier: &modifier,
            proposer: &NullProposer,
            dry_run: false,
        };

        let report = coordinator(vec![])
            .handle(
                &ctx,
                &[Issue::new(IssueKind::Unknown, "mystery", "???")],
                &TrustingVerifier,
                None,
            )
            .await;
        assert_eq!(report.unrouted.len(), 1);
        assert!(report.fixes.is_empty());
    }

    #[tokio::test]
    async fn formatters_run_after_other_agents() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut formatter = StubAgent::new(AgentId::Formatter, IssueKind::Formatting, 0.9);
        formatter.order_log = Some(Arc::clone(&order));
        let mut fixer = StubAgent::new(AgentId::TypeErrorFixer, IssueKind::TypeError, 0.8);
        fixer.order_log = Some(Arc::clone(&order));

        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let ctx = FixContext {
            root: dir.path(),
            modifier: &modifier,
            proposer: &NullProposer,
            dry_run: false,
        };

        coordinator(vec![Arc::new(formatter), Arc::new(fixer)])
            .handle(
                &ctx,
                &[
                    issue(IssueKind::Formatting, "a.py", 1),
                    issue(IssueKind::TypeError, "b.py", 2),
                ],
                &TrustingVerifier,
                None,
            )
            .await;

        let order = order.lock().unwrap();
        assert_eq!(*order, vec![AgentId::TypeErrorFixer, AgentId::Formatter]);
    }

    #[tokio::test]
    async fn cross_cutting_location_goes_to_higher_confidence() {
        let complexity = Arc::new(StubAgent::new(
            AgentId::ComplexityReducer,
            IssueKind::Complexity,
            0.75,
        ));
        let duplication = Arc::new(StubAgent::new(
            AgentId::DuplicationRemover,
            IssueKind::Duplication,
            0.7,
        ));
        let dup_calls = Arc::clone(&duplication.calls);

        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let ctx = FixContext {
            root: dir.path(),
            modifier: &modifier,
            proposer: &NullProposer,
            dry_run: false,
        };

        // Same function flagged for both complexity and duplication.
        let report = coordinator(vec![complexity, duplication])
            .handle(
                &ctx,
                &[
                    issue(IssueKind::Complexity, "a.py", 10),
                    issue(IssueKind::Duplication, "a.py", 10),
                ],
                &TrustingVerifier,
                None,
            )
            .await;

        assert_eq!(report.deferred.len(), 1);
        assert_eq!(report.deferred[0].kind, IssueKind::Duplication);
        assert_eq!(dup_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_verification_downgrades_fix() {
        let agent = Arc::new(StubAgent::new(AgentId::TestFixer, IssueKind::TestFailure, 0.8));
        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let ctx = FixContext {
            root: dir.path(),
            modifier: &modifier,
            proposer: &NullProposer,
            dry_run: false,
        };

        let report = coordinator(vec![agent])
            .handle(
                &ctx,
                &[issue(IssueKind::TestFailure, "tests/test_a.py", 5)],
                &RejectingVerifier,
                None,
            )
            .await;

        assert_eq!(report.successful_fixes(), 0);
        assert_eq!(report.fixes.len(), 1);
        assert!(report.fixes[0].error.as_deref().unwrap().contains("still fails"));
    }

    #[tokio::test]
    async fn low_confidence_result_never_counts_as_success() {
        // Agent advertises 0.8 but reports 0.4 on the actual fix.
        let mut agent = StubAgent::new(AgentId::SecurityHardener, IssueKind::Security, 0.8);
        agent.confidence = 0.4;

        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let ctx = FixContext {
            root: dir.path(),
            modifier: &modifier,
            proposer: &NullProposer,
            dry_run: false,
        };

        let report = coordinator(vec![Arc::new(agent)])
            .handle(
                &ctx,
                &[issue(IssueKind::Security, "a.py", 2)],
                &TrustingVerifier,
                None,
            )
            .await;

        assert_eq!(report.successful_fixes(), 0);
        assert!(report.fixes[0]
            .error
            .as_deref()
            .unwrap()
            .contains("below threshold"));
    }

    #[tokio::test]
    async fn cancellation_skips_dispatch() {
        let agent = Arc::new(StubAgent::new(AgentId::TestFixer, IssueKind::TestFailure, 0.8));
        let calls = Arc::clone(&agent.calls);

        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let ctx = FixContext {
            root: dir.path(),
            modifier: &modifier,
            proposer: &NullProposer,
            dry_run: false,
        };

        let (tx, rx) = watch::channel(true);
        let report = coordinator(vec![agent])
            .handle(
                &ctx,
                &[issue(IssueKind::TestFailure, "a.py", 1)],
                &TrustingVerifier,
                Some(&rx),
            )
            .await;
        drop(tx);

        assert!(report.cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(report.fixes.is_empty());
    }

    #[tokio::test]
    async fn routing_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let modifier = ctx_parts(dir.path());
        let issues = vec![
            issue(IssueKind::Formatting, "a.py", 1),
            issue(IssueKind::TypeError, "b.py", 2),
            issue(IssueKind::Security, "c.py", 3),
        ];

        let mut baseline: Option<Vec<(AgentId, usize)>> = None;
        for _ in 0..3 {
            let ctx = FixContext {
                root: dir.path(),
                modifier: &modifier,
                proposer: &NullProposer,
                dry_run: false,
            };
            let report = AgentCoordinator::new(
                Arc::new(AgentRegistry::new()),
                CoordinatorConfig::default(),
            )
            .handle(&ctx, &issues, &TrustingVerifier, None)
            .await;

            let mut shape: Vec<(AgentId, usize)> = report
                .fixes
                .iter()
                .map(|f| (f.agent, f.issues.len()))
                .collect();
            shape.sort();
            match &baseline {
                None => baseline = Some(shape),
                Some(expected) => assert_eq!(&shape, expected),
            }
        }
    }
}
