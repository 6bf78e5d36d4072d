//! Job observers
//!
//! The registry reports every creation, state change and output line to its
//! observers after releasing its lock. Observers must not block; a panicking
//! observer is logged and skipped.

use fleet_core::domain::job::{JobFailure, JobId, JobState};
use fleet_core::domain::log::LogEntry;
use fleet_core::domain::operation::Operation;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Created {
        job_id: JobId,
        operation: Operation,
        target_host: Option<String>,
        parent_id: Option<JobId>,
    },
    Transitioned {
        job_id: JobId,
        from: JobState,
        to: JobState,
        error: Option<JobFailure>,
    },
    Output {
        job_id: JobId,
        entry: LogEntry,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Created { job_id, .. }
            | JobEvent::Transitioned { job_id, .. }
            | JobEvent::Output { job_id, .. } => *job_id,
        }
    }
}

pub trait JobObserver: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

/// Fans events out to any number of async subscribers
///
/// Slow subscribers lag and lose the oldest events rather than holding up the
/// registry.
pub struct ChannelObserver {
    tx: broadcast::Sender<JobEvent>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl JobObserver for ChannelObserver {
    fn on_event(&self, event: &JobEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}
