//! Security, validation, and safe filesystem mutation for crackerjack.
//!
//! Every component that touches the filesystem or launches a subprocess goes
//! through this crate:
//! - Path confinement and symlink refusal
//! - Sanitized subprocess execution with timeouts and group kill
//! - Validation of AI-proposed file content before it reaches disk
//! - Atomic, backed-up, rollback-capable file writes
//! - A security event log and a failure rate limiter

pub mod events;
pub mod file_modifier;
pub mod input;
pub mod paths;
pub mod proposal;
pub mod rate_limiter;
pub mod subprocess;

pub use events::{SecurityEvent, SecurityEventKind, SecurityLog};
pub use file_modifier::{ApplyOptions, ApplyOutcome, Backup, ModifyError, SafeFileModifier};
pub use paths::{PathPolicy, PathValidator};
pub use proposal::{ContentValidator, ProposalVerdict};
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimitConfig};
pub use subprocess::{
    ChildStream, CommandOutput, CommandSpec, StreamLine, StreamSource, SubprocessError,
    SubprocessExecutor,
};
