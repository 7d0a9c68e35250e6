use async_trait::async_trait;
use cj_core::types::{AgentCapability, AgentId, FixResult, Issue, IssueKind};

use crate::agent::{apply_proposals, FixAgent, FixContext};

// ---------------------------------------------------------------------------
// TypeErrorFixerAgent
// ---------------------------------------------------------------------------

/// Repairs static type errors reported by the type checker.
pub struct TypeErrorFixerAgent;

#[async_trait]
impl FixAgent for TypeErrorFixerAgent {
    fn id(&self) -> AgentId {
        AgentId::TypeErrorFixer
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::TypeErrorFixer,
            kinds: vec![(IssueKind::TypeError, 0.78)],
            batch: true,
            collaborative: false,
        }
    }

    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
        apply_proposals(
            self.id(),
            0.78,
            ctx,
            issues,
            "Fix the reported static type errors. Prefer adding or \
             correcting annotations and narrowing over casts; never silence \
             a diagnostic with an ignore comment.",
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// TestFixerAgent
// ---------------------------------------------------------------------------

/// Repairs failing tests, preferring to fix the code under test when the
/// traceback shows a genuine defect.
pub struct TestFixerAgent;

#[async_trait]
impl FixAgent for TestFixerAgent {
    fn id(&self) -> AgentId {
        AgentId::TestFixer
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::TestFixer,
            kinds: vec![(IssueKind::TestFailure, 0.8)],
            batch: true,
            collaborative: false,
        }
    }

    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
        apply_proposals(
            self.id(),
            0.8,
            ctx,
            issues,
            "Make the failing tests pass. Read the traceback in each \
             finding; when the assertion is right and the code is wrong, fix \
             the code, otherwise fix the test. Never delete a test to make \
             the suite green.",
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// TestCreatorAgent
// ---------------------------------------------------------------------------

/// Writes new tests to recover lost coverage.
pub struct TestCreatorAgent;

#[async_trait]
impl FixAgent for TestCreatorAgent {
    fn id(&self) -> AgentId {
        AgentId::TestCreator
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::TestCreator,
            kinds: vec![(IssueKind::CoverageRegression, 0.75)],
            batch: false,
            collaborative: false,
        }
    }

    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
        apply_proposals(
            self.id(),
            0.75,
            ctx,
            issues,
            "Coverage fell below the ratcheted baseline. Add focused tests \
             for the uncovered code paths named in the findings; do not \
             modify production code.",
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
