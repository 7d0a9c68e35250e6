use std::collections::BTreeMap;
use std::sync::Arc;

use cj_core::types::{AgentId, IssueKind};
use tracing::debug;

use crate::agent::FixAgent;
use crate::agents::all_agents;

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// The process-wide agent table. Built once from the static capability set
/// and closed afterwards, which keeps routing deterministic within a run.
pub struct AgentRegistry {
    agents: Vec<Arc<dyn FixAgent>>,
    /// kind -> (confidence, agent index), best agent per kind, precomputed.
    best: BTreeMap<IssueKind, (f64, usize)>,
}

impl AgentRegistry {
    /// Build the registry from the built-in agents.
    pub fn new() -> Self {
        Self::with_agents(all_agents())
    }

    /// Build from an explicit agent set (tests inject stubs here).
    pub fn with_agents(agents: Vec<Arc<dyn FixAgent>>) -> Self {
        let mut best: BTreeMap<IssueKind, (f64, usize)> = BTreeMap::new();
        for (index, agent) in agents.iter().enumerate() {
            for (kind, confidence) in agent.capability().kinds {
                let replace = match best.get(&kind) {
                    None => true,
                    // Strictly-greater wins; ties keep the earlier
                    // registration so routing stays stable.
                    Some((existing, _)) => confidence > *existing,
                };
                if replace {
                    best.insert(kind, (confidence, index));
                }
            }
        }
        debug!(agents = agents.len(), kinds = best.len(), "agent registry built");
        Self { agents, best }
    }

    /// Highest-confidence agent for a kind, with its confidence.
    pub fn best_for(&self, kind: IssueKind) -> Option<(Arc<dyn FixAgent>, f64)> {
        if !kind.is_routable() {
            return None;
        }
        self.best
            .get(&kind)
            .map(|(confidence, index)| (Arc::clone(&self.agents[*index]), *confidence))
    }

    pub fn get(&self, id: AgentId) -> Option<Arc<dyn FixAgent>> {
        self.agents.iter().find(|a| a.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Kinds at least one agent covers.
    pub fn covered_kinds(&self) -> Vec<IssueKind> {
        self.best.keys().copied().collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
