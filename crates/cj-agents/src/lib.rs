//! Agent layer for crackerjack — issue classification, the fixing-agent
//! trait and its specialized implementations, confidence-based routing, and
//! the workflow orchestrator that drives the whole loop.

pub mod agent;
pub mod agents;
pub mod classify;
pub mod coordinator;
pub mod jobs;
pub mod registry;
pub mod workflow;

pub use agent::{FixAgent, FixContext, FixProposer, NullProposer, Proposal, ProposalRequest};
pub use coordinator::{
    AgentCoordinator, CoordinatorConfig, DispatchReport, FixVerifier, TrustingVerifier,
};
pub use jobs::{JobEvent, JobId, JobManager, JobSnapshot, JobStatus};
pub use registry::AgentRegistry;
pub use workflow::{WorkflowEngine, WorkflowError};
