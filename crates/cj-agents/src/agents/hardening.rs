use async_trait::async_trait;
use cj_core::types::{AgentCapability, AgentId, FixResult, Issue, IssueKind};

use crate::agent::{apply_proposals, FixAgent, FixContext};

// ---------------------------------------------------------------------------
// SecurityHardenerAgent
// ---------------------------------------------------------------------------

/// Replaces insecure constructs flagged by the security audit.
pub struct SecurityHardenerAgent;

#[async_trait]
impl FixAgent for SecurityHardenerAgent {
    fn id(&self) -> AgentId {
        AgentId::SecurityHardener
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::SecurityHardener,
            kinds: vec![(IssueKind::Security, 0.8)],
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
            "Replace the insecure constructs these findings identify with \
             safe equivalents: parameterized subprocess calls, modern \
             hashes, safe deserialization. Preserve behavior for trusted \
             inputs.",
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// PerformanceOptimizerAgent
// ---------------------------------------------------------------------------

/// Applies the modernization/performance rewrites the scanner suggests.
pub struct PerformanceOptimizerAgent;

#[async_trait]
impl FixAgent for PerformanceOptimizerAgent {
    fn id(&self) -> AgentId {
        AgentId::PerformanceOptimizer
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::PerformanceOptimizer,
            kinds: vec![(IssueKind::Performance, 0.72)],
            batch: true,
            collaborative: false,
        }
    }

    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
        apply_proposals(
            self.id(),
            0.72,
            ctx,
            issues,
            "Apply the suggested rewrites from each finding. Keep the \
             change minimal and semantics-preserving; skip a finding rather \
             than restructure around it.",
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// ComplexityReducerAgent
// ---------------------------------------------------------------------------

/// Decomposes functions whose cognitive complexity exceeds the limit.
pub struct ComplexityReducerAgent;

#[async_trait]
impl FixAgent for ComplexityReducerAgent {
    fn id(&self) -> AgentId {
        AgentId::ComplexityReducer
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::ComplexityReducer,
            kinds: vec![(IssueKind::Complexity, 0.75)],
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
            "Break the flagged functions into smaller helpers until each \
             stays under the complexity limit. Public signatures must not \
             change.",
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_cover_expected_kinds() {
        assert_eq!(
            SecurityHardenerAgent
                .capability()
                .confidence_for(IssueKind::Security),
            Some(0.8)
        );
        assert_eq!(
            PerformanceOptimizerAgent
                .capability()
                .confidence_for(IssueKind::Performance),
            Some(0.72)
        );
        assert_eq!(
            ComplexityReducerAgent
                .capability()
                .confidence_for(IssueKind::Complexity),
            Some(0.75)
        );
    }

    #[test]
    fn no_agent_here_claims_foreign_kinds() {
        for agent in [
            &SecurityHardenerAgent as &dyn FixAgent,
            &PerformanceOptimizerAgent,
            &ComplexityReducerAgent,
        ] {
            assert!(!agent.capability().supports(IssueKind::Formatting));
            assert!(!agent.capability().supports(IssueKind::TestFailure));
        }
    }
}
