//! Job registry
//!
//! In-memory arena of job records keyed by id. The registry enforces the job
//! lifecycle:
//!
//! - transitions only move forward (`Pending -> Running -> terminal`, or
//!   `Pending -> Cancelled | Failed | Partial`); nothing leaves a terminal state
//! - a job with unfinished children cannot become terminal
//! - when a child ends, its parent is re-aggregated under the same lock: a failed
//!   or cancelled child cancels its pending siblings, and once every child is
//!   terminal the parent becomes Completed, Partial, Failed or Cancelled
//!
//! Top-level records also carry the resource claims their submission made;
//! claims of non-terminal jobs block conflicting submissions.
//!
//! The lock is a plain `std::sync::Mutex` held only for in-memory mutation.
//! Observers are notified after it is released.

use chrono::{DateTime, TimeDelta, Utc};
use fleet_core::domain::job::{FailureKind, Job, JobFailure, JobId, JobState};
use fleet_core::domain::log::LogEntry;
use fleet_core::domain::operation::Operation;
use fleet_core::domain::resource::ResourceClaim;
use fleet_core::dto::job::{JobFilter, JobSummary, JobView};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::observer::{JobEvent, JobObserver};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("job {id} still has {active} unfinished children")]
    ChildrenActive { id: JobId, active: usize },

    #[error("job {child} cannot be linked to {parent}: {reason}")]
    InvalidLink {
        parent: JobId,
        child: JobId,
        reason: String,
    },

    #[error("{resource} on {host} is in use by job {holder}")]
    ResourceBusy {
        resource: String,
        host: String,
        holder: JobId,
    },
}

/// A resource claim scoped to one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostClaim {
    pub host: String,
    pub claim: ResourceClaim,
}

impl HostClaim {
    pub fn new(host: &str, claim: ResourceClaim) -> Self {
        Self {
            host: host.to_lowercase(),
            claim,
        }
    }

    pub fn conflicts_with(&self, other: &HostClaim) -> bool {
        self.host == other.host && self.claim.conflicts_with(&other.claim)
    }
}

/// Eviction policy for finished top-level jobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retention {
    /// Finished top-level jobs kept at most
    pub max_jobs: usize,
    /// Age after which a finished job is dropped regardless of count
    pub ttl: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_jobs: 1000,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Number of known jobs per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStateCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub partial: usize,
    pub cancelled: usize,
}

impl JobStateCounts {
    fn add(&mut self, state: JobState) {
        match state {
            JobState::Pending => self.pending += 1,
            JobState::Running => self.running += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Partial => self.partial += 1,
            JobState::Cancelled => self.cancelled += 1,
        }
    }
}

struct Record {
    job: Job,
    claims: Vec<HostClaim>,
    state_tx: watch::Sender<JobState>,
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<JobId, Record>,
}

pub struct JobRegistry {
    state: Mutex<RegistryState>,
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
    retention: Retention,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(Retention::default())
    }
}

impl JobRegistry {
    pub fn new(retention: Retention) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            observers: RwLock::new(Vec::new()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Creates a Pending job; a parent, when given, must already exist
    pub fn create(
        &self,
        operation: Operation,
        target_host: Option<String>,
        parameters: serde_json::Value,
        parent_id: Option<JobId>,
    ) -> Result<JobId, RegistryError> {
        self.insert(Job::new(operation, target_host, parameters, parent_id), Vec::new())
    }

    /// Creates a top-level Pending job holding `claims` until it is terminal
    ///
    /// Fails with [`RegistryError::ResourceBusy`] when an active job already
    /// holds a conflicting claim. Check and insert happen under one lock.
    pub fn create_claimed(
        &self,
        operation: Operation,
        target_host: Option<String>,
        parameters: serde_json::Value,
        claims: Vec<HostClaim>,
    ) -> Result<JobId, RegistryError> {
        self.insert(Job::new(operation, target_host, parameters, None), claims)
    }

    fn insert(&self, job: Job, claims: Vec<HostClaim>) -> Result<JobId, RegistryError> {
        let id = job.id;
        let event = {
            let mut state = self.lock();
            if let Some(parent) = job.parent_id {
                if !state.records.contains_key(&parent) {
                    return Err(RegistryError::NotFound(parent));
                }
            }
            if let Some((claim, holder)) = state.find_conflict(&claims) {
                return Err(RegistryError::ResourceBusy {
                    resource: claim.claim.key.to_string(),
                    host: claim.host.clone(),
                    holder,
                });
            }

            let event = JobEvent::Created {
                job_id: id,
                operation: job.operation,
                target_host: job.target_host.clone(),
                parent_id: job.parent_id,
            };
            let (state_tx, _) = watch::channel(job.state);
            state.records.insert(
                id,
                Record {
                    job,
                    claims,
                    state_tx,
                },
            );
            event
        };

        self.notify(vec![event]);
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Result<JobView, RegistryError> {
        self.snapshot(id).map(JobView::from)
    }

    /// Full copy of the job record
    pub fn snapshot(&self, id: JobId) -> Result<Job, RegistryError> {
        let state = self.lock();
        state
            .records
            .get(&id)
            .map(|record| record.job.clone())
            .ok_or(RegistryError::NotFound(id))
    }

    pub fn state(&self, id: JobId) -> Result<JobState, RegistryError> {
        let state = self.lock();
        state
            .records
            .get(&id)
            .map(|record| record.job.state)
            .ok_or(RegistryError::NotFound(id))
    }

    pub fn append_output(&self, id: JobId, entry: LogEntry) -> Result<(), RegistryError> {
        {
            let mut state = self.lock();
            let record = state
                .records
                .get_mut(&id)
                .ok_or(RegistryError::NotFound(id))?;
            record.job.output.push(entry.clone());
        }
        self.notify(vec![JobEvent::Output { job_id: id, entry }]);
        Ok(())
    }

    /// Stores the structured data returned by the agent
    pub fn record_result(&self, id: JobId, data: serde_json::Value) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        record.job.result = Some(data);
        Ok(())
    }

    /// Moves a job to `next`, re-aggregating its ancestors when it ends
    pub fn transition(
        &self,
        id: JobId,
        next: JobState,
        error: Option<JobFailure>,
    ) -> Result<(), RegistryError> {
        let events = {
            let mut state = self.lock();
            let mut events = Vec::new();
            state.apply(id, next, error, &mut events)?;
            if next.is_terminal() {
                state.aggregate_ancestors(id, &mut events);
            }
            events
        };
        self.notify(events);
        Ok(())
    }

    /// Cancels the job only if it has not started; returns whether it did
    ///
    /// Running jobs belong to their worker, which observes cancellation
    /// through its token and records the outcome itself.
    pub fn cancel_if_pending(&self, id: JobId, reason: &str) -> Result<bool, RegistryError> {
        let events = {
            let mut state = self.lock();
            let record = state.records.get(&id).ok_or(RegistryError::NotFound(id))?;
            if record.job.state != JobState::Pending {
                return Ok(false);
            }
            let mut events = Vec::new();
            let failure = JobFailure::new(FailureKind::Cancelled, reason);
            state.apply(id, JobState::Cancelled, Some(failure), &mut events)?;
            state.aggregate_ancestors(id, &mut events);
            events
        };
        self.notify(events);
        Ok(true)
    }

    /// Appends `child` to `parent`'s ordered children
    pub fn link_child(&self, parent: JobId, child: JobId) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let invalid = |reason: &str| RegistryError::InvalidLink {
            parent,
            child,
            reason: reason.to_string(),
        };

        if parent == child {
            return Err(invalid("a job cannot be its own child"));
        }
        let parent_record = state
            .records
            .get(&parent)
            .ok_or(RegistryError::NotFound(parent))?;
        if parent_record.job.is_terminal() {
            return Err(invalid("parent already finished"));
        }

        let child_record = state
            .records
            .get_mut(&child)
            .ok_or(RegistryError::NotFound(child))?;
        match child_record.job.parent_id {
            Some(existing) if existing != parent => return Err(invalid("child has another parent")),
            _ => child_record.job.parent_id = Some(parent),
        }

        if let Some(parent_record) = state.records.get_mut(&parent) {
            if !parent_record.job.children.contains(&child) {
                parent_record.job.children.push(child);
            }
        }
        Ok(())
    }

    /// Jobs matching `filter`, oldest first
    pub fn list(&self, filter: &JobFilter) -> Vec<JobSummary> {
        let state = self.lock();
        let mut jobs: Vec<JobSummary> = state
            .records
            .values()
            .filter(|record| filter.matches(&record.job))
            .map(|record| JobSummary::from(&record.job))
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn counts(&self) -> JobStateCounts {
        let state = self.lock();
        let mut counts = JobStateCounts::default();
        for record in state.records.values() {
            counts.add(record.job.state);
        }
        counts
    }

    /// Suspends until the job reaches a terminal state
    ///
    /// Returns `NotFound` if the job is unknown or evicted while waiting.
    pub async fn wait_terminal(&self, id: JobId) -> Result<JobView, RegistryError> {
        let mut rx = {
            let state = self.lock();
            state
                .records
                .get(&id)
                .ok_or(RegistryError::NotFound(id))?
                .state_tx
                .subscribe()
        };
        if rx.wait_for(|state| state.is_terminal()).await.is_err() {
            return Err(RegistryError::NotFound(id));
        }
        self.get(id)
    }

    /// Drops finished top-level jobs past the TTL or beyond the retention count
    ///
    /// Children go with their parent. Returns the number of records removed.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = TimeDelta::from_std(self.retention.ttl).unwrap_or(TimeDelta::MAX);

        let mut state = self.lock();
        let mut finished: Vec<(DateTime<Utc>, JobId)> = state
            .records
            .values()
            .filter(|record| record.job.parent_id.is_none() && record.job.is_terminal())
            .map(|record| {
                let at = record.job.finished_at.unwrap_or(record.job.created_at);
                (at, record.job.id)
            })
            .collect();
        finished.sort();

        let excess = finished.len().saturating_sub(self.retention.max_jobs);
        let mut doomed: Vec<JobId> = finished
            .iter()
            .enumerate()
            .filter(|(index, (at, _))| *index < excess || now.signed_duration_since(*at) > ttl)
            .map(|(_, (_, id))| *id)
            .collect();

        let mut removed = 0;
        while let Some(id) = doomed.pop() {
            if let Some(record) = state.records.remove(&id) {
                doomed.extend(record.job.children);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Evicted {} finished job records", removed);
        }
        removed
    }

    fn notify(&self, events: Vec<JobEvent>) {
        if events.is_empty() {
            return;
        }
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for event in &events {
            for observer in &observers {
                if catch_unwind(AssertUnwindSafe(|| observer.on_event(event))).is_err() {
                    warn!("Job observer panicked while handling event for {}", event.job_id());
                }
            }
        }
    }
}

impl RegistryState {
    fn find_conflict<'a>(&self, claims: &'a [HostClaim]) -> Option<(&'a HostClaim, JobId)> {
        if claims.is_empty() {
            return None;
        }
        self.records
            .values()
            .filter(|record| !record.job.is_terminal())
            .find_map(|record| {
                claims.iter().find_map(|wanted| {
                    record
                        .claims
                        .iter()
                        .any(|held| held.conflicts_with(wanted))
                        .then_some((wanted, record.job.id))
                })
            })
    }

    fn active_children(&self, job: &Job) -> usize {
        job.children
            .iter()
            .filter(|child| {
                self.records
                    .get(child)
                    .is_some_and(|record| !record.job.is_terminal())
            })
            .count()
    }

    fn apply(
        &mut self,
        id: JobId,
        next: JobState,
        error: Option<JobFailure>,
        events: &mut Vec<JobEvent>,
    ) -> Result<(), RegistryError> {
        let record = self.records.get(&id).ok_or(RegistryError::NotFound(id))?;
        let from = record.job.state;
        if !from.can_transition_to(next) {
            return Err(RegistryError::IllegalTransition { id, from, to: next });
        }
        if next.is_terminal() {
            let active = self.active_children(&record.job);
            if active > 0 {
                return Err(RegistryError::ChildrenActive { id, active });
            }
        }

        let record = self
            .records
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        let now = Utc::now();
        record.job.state = next;
        if next == JobState::Running {
            record.job.started_at = Some(now);
        }
        if next.is_terminal() {
            record.job.finished_at = Some(now);
        }
        if error.is_some() {
            record.job.error = error.clone();
        }
        record.state_tx.send_replace(next);

        events.push(JobEvent::Transitioned {
            job_id: id,
            from,
            to: next,
            error,
        });
        Ok(())
    }

    /// Walks up from a job that just ended, settling each ancestor it can
    fn aggregate_ancestors(&mut self, ended: JobId, events: &mut Vec<JobEvent>) {
        let mut current = ended;
        loop {
            let Some(child) = self.records.get(&current) else {
                return;
            };
            let child_state = child.job.state;
            let Some(parent_id) = child.job.parent_id else {
                return;
            };
            let Some(parent) = self.records.get(&parent_id) else {
                return;
            };
            if parent.job.is_terminal() {
                return;
            }
            let siblings = parent.job.children.clone();

            if matches!(
                child_state,
                JobState::Failed | JobState::Partial | JobState::Cancelled
            ) {
                self.cancel_pending_siblings(&siblings, current, child_state, events);
            }

            let states: Vec<JobState> = siblings
                .iter()
                .filter_map(|id| self.records.get(id).map(|record| record.job.state))
                .collect();
            if states.iter().any(|state| !state.is_terminal()) {
                return;
            }

            let outcome = aggregate(&states);
            let error = (outcome != JobState::Completed).then(|| self.child_failure(&siblings));

            let parent_state = self.records.get(&parent_id).map(|record| record.job.state);
            if parent_state == Some(JobState::Pending) && outcome == JobState::Completed {
                if let Err(e) = self.apply(parent_id, JobState::Running, None, events) {
                    warn!("Cannot start parent {} during aggregation: {}", parent_id, e);
                    return;
                }
            }
            if let Err(e) = self.apply(parent_id, outcome, error, events) {
                warn!("Cannot settle parent {}: {}", parent_id, e);
                return;
            }
            debug!("Parent job {} settled as {}", parent_id, outcome);
            current = parent_id;
        }
    }

    fn cancel_pending_siblings(
        &mut self,
        siblings: &[JobId],
        ended: JobId,
        ended_state: JobState,
        events: &mut Vec<JobEvent>,
    ) {
        for sibling in siblings {
            if *sibling == ended {
                continue;
            }
            let pending = self
                .records
                .get(sibling)
                .is_some_and(|record| record.job.state == JobState::Pending);
            if !pending {
                continue;
            }
            let failure = JobFailure::new(
                FailureKind::Cancelled,
                format!("skipped because step {} ended {}", ended, ended_state),
            );
            if let Err(e) = self.apply(*sibling, JobState::Cancelled, Some(failure), events) {
                warn!("Cannot cancel sibling {}: {}", sibling, e);
            }
        }
    }

    /// Error recorded on a parent that did not complete
    fn child_failure(&self, children: &[JobId]) -> JobFailure {
        let failed = children.iter().find_map(|id| {
            let job = &self.records.get(id)?.job;
            match (job.state, &job.error) {
                (JobState::Failed | JobState::Partial, Some(error)) => Some((job, error)),
                _ => None,
            }
        });

        match failed {
            Some((job, error)) => JobFailure::new(
                FailureKind::ChildFailed,
                format!("step {} ({}) failed: {}", job.operation, job.id, error.message),
            )
            .with_code(error.code.clone()),
            None => JobFailure::new(FailureKind::Cancelled, "cancelled before all steps completed"),
        }
    }
}

/// Parent state once every child is terminal
fn aggregate(children: &[JobState]) -> JobState {
    if children.iter().all(|state| *state == JobState::Completed) {
        JobState::Completed
    } else if children
        .iter()
        .any(|state| matches!(state, JobState::Completed | JobState::Partial))
    {
        JobState::Partial
    } else if children.contains(&JobState::Failed) {
        JobState::Failed
    } else {
        JobState::Cancelled
    }
}
