//! The specialized fixing agents. Each one covers a small set of issue
//! kinds; mechanical rewrites are done in-process, semantic rewrites go
//! through the injected fix proposer and are validated before touching disk.

mod correctness;
mod formatting;
mod hardening;
mod hygiene;

pub use correctness::{TestCreatorAgent, TestFixerAgent, TypeErrorFixerAgent};
pub use formatting::{FormatterAgent, ImportOrganizerAgent};
pub use hardening::{ComplexityReducerAgent, PerformanceOptimizerAgent, SecurityHardenerAgent};
pub use hygiene::{DeadCodeRemoverAgent, DocumentationWriterAgent, DuplicationRemoverAgent};

use std::sync::Arc;

use crate::agent::FixAgent;

/// Every built-in agent, in registration order.
pub fn all_agents() -> Vec<Arc<dyn FixAgent>> {
    vec![
        Arc::new(FormatterAgent),
        Arc::new(ImportOrganizerAgent),
        Arc::new(DeadCodeRemoverAgent),
        Arc::new(DuplicationRemoverAgent),
        Arc::new(DocumentationWriterAgent),
        Arc::new(TypeErrorFixerAgent),
        Arc::new(TestFixerAgent),
        Arc::new(TestCreatorAgent),
        Arc::new(SecurityHardenerAgent),
        Arc::new(PerformanceOptimizerAgent),
        Arc::new(ComplexityReducerAgent),
    ]
}
