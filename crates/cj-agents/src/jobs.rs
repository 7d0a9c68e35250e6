use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use cj_core::types::{WorkflowOptions, WorkflowResult};

use crate::workflow::{WorkflowEngine, WorkflowError};

pub type JobId = Uuid;

// ---------------------------------------------------------------------------
// Events & snapshots
// ---------------------------------------------------------------------------

/// One progress event on a job's ordered stream. Emitted at every phase
/// transition and per hook/test completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Filled in by the job manager; engines emit with `None`.
    pub job_id: Option<JobId>,
    pub phase: String,
    /// Fraction of the run completed, in [0,1].
    pub progress: f64,
    pub status: String,
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub phase: String,
    pub progress: f64,
    pub submitted_at: DateTime<Utc>,
    /// Present once the run finishes.
    pub result: Option<WorkflowResult>,
}

// ---------------------------------------------------------------------------
// JobManager
// ---------------------------------------------------------------------------

struct JobHandle {
    snapshot: Arc<Mutex<JobSnapshot>>,
    cancel: watch::Sender<bool>,
    events: flume::Receiver<JobEvent>,
}

/// The job-control surface for external drivers: submit a run, poll its
/// snapshot, stream its ordered events, cancel it.
pub struct JobManager {
    root: PathBuf,
    jobs: DashMap<JobId, JobHandle>,
}

impl JobManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            jobs: DashMap::new(),
        }
    }

    /// Submit a run against the manager's project root.
    pub fn submit(&self, options: WorkflowOptions) -> Result<JobId, WorkflowError> {
        let engine = WorkflowEngine::new(&self.root)?;
        Ok(self.submit_engine(engine, options))
    }

    /// Submit with a pre-built engine (tests wire stub runners through
    /// this).
    pub fn submit_engine(&self, engine: WorkflowEngine, options: WorkflowOptions) -> JobId {
        let id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (engine_tx, engine_rx) = flume::unbounded::<JobEvent>();
        let (public_tx, public_rx) = flume::unbounded::<JobEvent>();

        let snapshot = Arc::new(Mutex::new(JobSnapshot {
            id,
            status: JobStatus::Running,
            phase: String::new(),
            progress: 0.0,
            submitted_at: Utc::now(),
            result: None,
        }));

        // Forwarder: stamp the job id, mirror progress into the snapshot,
        // and relay on the public stream. A single channel preserves
        // per-job ordering.
        {
            let snapshot = Arc::clone(&snapshot);
            tokio::spawn(async move {
                while let Ok(mut event) = engine_rx.recv_async().await {
                    event.job_id = Some(id);
                    {
                        let mut snap = snapshot.lock().expect("job snapshot poisoned");
                        snap.phase = event.phase.clone();
                        if event.progress >= snap.progress {
                            snap.progress = event.progress;
                        }
                    }
                    if public_tx.send_async(event).await.is_err() {
                        break;
                    }
                }
            });
        }

        // The run itself.
        {
            let snapshot = Arc::clone(&snapshot);
            let engine = engine.with_events(engine_tx).with_cancel(cancel_rx);
            tokio::spawn(async move {
                let outcome = engine.run(options).await;
                let mut snap = snapshot.lock().expect("job snapshot poisoned");
                match outcome {
                    Ok(result) => {
                        snap.status = match result.outcome {
                            cj_core::types::WorkflowOutcome::Success => JobStatus::Completed,
                            cj_core::types::WorkflowOutcome::Cancelled => JobStatus::Cancelled,
                            _ => JobStatus::Failed,
                        };
                        snap.progress = 1.0;
                        snap.result = Some(result);
                    }
                    Err(e) => {
                        warn!(job = %id, error = %e, "job failed fatally");
                        snap.status = JobStatus::Failed;
                    }
                }
                info!(job = %id, status = ?snap.status, "job finished");
            });
        }

        self.jobs.insert(
            id,
            JobHandle {
                snapshot,
                cancel: cancel_tx,
                events: public_rx,
            },
        );
        id
    }

    pub fn status(&self, id: JobId) -> Option<JobSnapshot> {
        self.jobs
            .get(&id)
            .map(|handle| handle.snapshot.lock().expect("job snapshot poisoned").clone())
    }

    /// The job's ordered event stream. Multiple calls share one stream;
    /// each event is delivered to one receiver.
    pub fn events(&self, id: JobId) -> Option<flume::Receiver<JobEvent>> {
        self.jobs.get(&id).map(|handle| handle.events.clone())
    }

    /// Request cancellation. Returns false for unknown jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.jobs.get(&id) {
            Some(handle) => handle.cancel.send(true).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
