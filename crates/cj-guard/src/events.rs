use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// SecurityEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    PathRejected,
    SymlinkRefused,
    ForbiddenTarget,
    DangerousProposal,
    SecretDetected,
    SubprocessRejected,
    RateLimited,
}

impl std::fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SecurityEventKind::PathRejected => "path_rejected",
            SecurityEventKind::SymlinkRefused => "symlink_refused",
            SecurityEventKind::ForbiddenTarget => "forbidden_target",
            SecurityEventKind::DangerousProposal => "dangerous_proposal",
            SecurityEventKind::SecretDetected => "secret_detected",
            SecurityEventKind::SubprocessRejected => "subprocess_rejected",
            SecurityEventKind::RateLimited => "rate_limited",
        };
        write!(f, "{}", label)
    }
}

/// One recorded security decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SecurityLog
// ---------------------------------------------------------------------------

/// Bounded in-process log of security events.
///
/// External collaborators (dashboard, report formatting) read recent events;
/// the workflow reads counts to decide whether repeated gate failures should
/// become fatal.
#[derive(Debug)]
pub struct SecurityLog {
    events: Mutex<VecDeque<SecurityEvent>>,
    capacity: usize,
}

impl SecurityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
        }
    }

    /// Record an event, evicting the oldest entry when full.
    pub fn record(&self, kind: SecurityEventKind, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(kind = %kind, detail = %detail, "security event");
        let mut events = self.events.lock().expect("security log lock poisoned");
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(SecurityEvent {
            kind,
            detail,
            timestamp: Utc::now(),
        });
    }

    /// Most recent events, newest last.
    pub fn recent(&self, n: usize) -> Vec<SecurityEvent> {
        let events = self.events.lock().expect("security log lock poisoned");
        events.iter().rev().take(n).rev().cloned().collect()
    }

    /// Total recorded (and retained) events.
    pub fn len(&self) -> usize {
        self.events.lock().expect("security log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of retained events of a given kind.
    pub fn count(&self, kind: SecurityEventKind) -> usize {
        let events = self.events.lock().expect("security log lock poisoned");
        events.iter().filter(|e| e.kind == kind).count()
    }
}

impl Default for SecurityLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
