//! Thread-backed worker pool for one task category
//!
//! Blocking remote calls run on dedicated OS threads so they never stall the
//! async control plane. Every queued task carries a [`Ticket`] whose state is
//! switched with compare-and-swap by exactly one side:
//!
//! ```text
//!   QUEUED --worker--> RUNNING --worker--> DONE
//!     |                   |
//!     +----caller---------+----caller----> DISCARDED
//! ```
//!
//! A caller that gives up on a RUNNING task abandons that worker thread: it is
//! no longer counted as part of the pool, a replacement is spawned, and the
//! abandoned thread exits as soon as its call returns.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

use super::TaskCategory;
use super::resources::{ResourceLimits, ResourceProbe};
use crate::config::PoolConfig;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const DISCARDED: u8 = 3;

pub(crate) type Work = Box<dyn FnOnce() + Send + 'static>;

/// Ownership token shared by a task's caller and the worker running it
#[derive(Debug)]
pub(crate) struct Ticket {
    state: AtomicU8,
}

impl Ticket {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(QUEUED),
        })
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks a running task finished; false when the caller already left
    pub(crate) fn finish(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.state.load(Ordering::Acquire) == DISCARDED
    }

    /// Returns the state the ticket was in when the caller discarded it
    fn discard(&self) -> u8 {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == DONE || current == DISCARDED {
                return current;
            }
            match self.state.compare_exchange(
                current,
                DISCARDED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }
}

struct QueuedTask {
    ticket: Arc<Ticket>,
    work: Work,
}

/// Scaling history of a pool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScalingState {
    /// Workers added because of backlog
    pub grown: u64,
    /// Surplus workers that exited after idling
    pub shrunk: u64,
    /// Workers spawned to replace abandoned ones
    pub replaced: u64,
    /// Growth attempts refused for lack of host resources
    pub denied: u64,
    pub last_adjustment: Option<DateTime<Utc>>,
}

impl ScalingState {
    fn touch(&mut self) {
        self.last_adjustment = Some(Utc::now());
    }
}

/// Snapshot of one pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub category: TaskCategory,
    pub queue_depth: usize,
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    /// Threads still stuck in a call nobody waits for
    pub abandoned: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scaling: ScalingState,
}

struct PoolState {
    queue: VecDeque<QueuedTask>,
    /// Live workers, excluding abandoned ones
    workers: usize,
    idle: usize,
    abandoned: usize,
    next_worker: u64,
    shutdown: bool,
    scaling: ScalingState,
}

pub(crate) struct WorkerPool {
    category: TaskCategory,
    config: PoolConfig,
    limits: ResourceLimits,
    probe: Arc<dyn ResourceProbe>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl WorkerPool {
    pub(crate) fn start(
        category: TaskCategory,
        config: PoolConfig,
        limits: ResourceLimits,
        probe: Arc<dyn ResourceProbe>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            category,
            config,
            limits,
            probe,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: 0,
                idle: 0,
                abandoned: 0,
                next_worker: 0,
                shutdown: false,
                scaling: ScalingState::default(),
            }),
            available: Condvar::new(),
        });

        {
            let mut state = pool.lock();
            for _ in 0..pool.config.min_workers {
                pool.spawn_worker(&mut state);
            }
        }

        info!(
            "Started {} pool ({}..={} workers)",
            category, pool.config.min_workers, pool.config.max_workers
        );
        pool
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `work`; returns false when the pool is shut down
    pub(crate) fn submit(self: &Arc<Self>, ticket: Arc<Ticket>, work: Work) -> bool {
        let mut state = self.lock();
        if state.shutdown {
            return false;
        }
        state.queue.push_back(QueuedTask { ticket, work });

        if state.queue.len() > state.idle && state.workers < self.config.max_workers {
            if state.workers < self.config.min_workers {
                self.spawn_worker(&mut state);
            } else if self.config.is_elastic() {
                let sample = self.probe.sample();
                if self.limits.permits_growth(&sample) {
                    if self.spawn_worker(&mut state) {
                        state.scaling.grown += 1;
                        state.scaling.touch();
                        debug!("{} pool grew to {} workers", self.category, state.workers);
                    }
                } else {
                    state.scaling.denied += 1;
                    debug!(
                        "{} pool growth denied (cpu {:.1}%, {} MB free)",
                        self.category, sample.cpu_percent, sample.available_memory_mb
                    );
                }
            }
        }

        self.available.notify_one();
        true
    }

    /// Called by a caller that stopped waiting for `ticket`
    pub(crate) fn discard(self: &Arc<Self>, ticket: &Arc<Ticket>) {
        match ticket.discard() {
            QUEUED => {
                let mut state = self.lock();
                state.queue.retain(|task| !Arc::ptr_eq(&task.ticket, ticket));
            }
            RUNNING => {
                let mut state = self.lock();
                state.workers -= 1;
                state.abandoned += 1;
                warn!(
                    "Abandoned a {} worker stuck in a remote call ({} abandoned)",
                    self.category, state.abandoned
                );

                let needs_worker = state.workers < self.config.min_workers
                    || (!state.queue.is_empty() && state.idle == 0);
                if !state.shutdown && needs_worker && state.workers < self.config.max_workers {
                    if self.spawn_worker(&mut state) {
                        state.scaling.replaced += 1;
                        state.scaling.touch();
                    }
                }
            }
            _ => {}
        }
    }

    /// Stops accepting work; queued tasks are dropped, running ones finish
    pub(crate) fn shutdown(&self) {
        let drained: Vec<QueuedTask> = {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queue.drain(..).collect()
        };
        for task in &drained {
            task.ticket.discard();
        }
        if !drained.is_empty() {
            debug!("{} pool dropped {} queued tasks", self.category, drained.len());
        }
        // Dropping the work closures closes their result channels
        drop(drained);
        self.available.notify_all();
    }

    pub(crate) fn metrics(&self) -> PoolMetrics {
        let state = self.lock();
        PoolMetrics {
            category: self.category,
            queue_depth: state.queue.len(),
            workers: state.workers,
            idle: state.idle,
            busy: state.workers - state.idle,
            abandoned: state.abandoned,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            scaling: state.scaling.clone(),
        }
    }

    /// Spawns one idle worker while the caller holds the state lock
    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) -> bool {
        let id = state.next_worker;
        state.next_worker += 1;

        let pool = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("fleet-{}-{}", self.category, id))
            .spawn(move || pool.worker_loop());

        match spawned {
            Ok(_) => {
                state.workers += 1;
                state.idle += 1;
                true
            }
            Err(e) => {
                warn!("Failed to spawn {} worker: {}", self.category, e);
                false
            }
        }
    }

    fn worker_loop(self: Arc<Self>) {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                state.idle -= 1;
                drop(state);

                let kept = Self::execute(task);

                state = self.lock();
                if !kept {
                    // Our slot was handed to a replacement when the caller gave up
                    state.abandoned -= 1;
                    debug!("Abandoned {} worker finished its call", self.category);
                    return;
                }
                state.idle += 1;
                continue;
            }

            if state.shutdown {
                state.workers -= 1;
                state.idle -= 1;
                return;
            }

            let (guard, wait) = self
                .available
                .wait_timeout(state, self.config.idle_timeout)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;

            if wait.timed_out()
                && state.queue.is_empty()
                && !state.shutdown
                && state.workers > self.config.min_workers
            {
                state.workers -= 1;
                state.idle -= 1;
                state.scaling.shrunk += 1;
                state.scaling.touch();
                debug!("{} pool shrank to {} workers", self.category, state.workers);
                return;
            }
        }
    }

    /// Runs one task; false when the worker was abandoned meanwhile
    fn execute(task: QueuedTask) -> bool {
        if !task.ticket.claim() {
            // Discarded while queued
            return true;
        }
        (task.work)();
        !task.ticket.is_discarded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_transitions() {
        let ticket = Ticket::new();
        assert!(ticket.claim());
        assert!(!ticket.claim());
        assert!(ticket.finish());
        assert_eq!(ticket.discard(), DONE);
        assert!(!ticket.is_discarded());

        let abandoned = Ticket::new();
        assert!(abandoned.claim());
        assert_eq!(abandoned.discard(), RUNNING);
        assert!(!abandoned.finish());
        assert!(abandoned.is_discarded());

        let skipped = Ticket::new();
        assert_eq!(skipped.discard(), QUEUED);
        assert!(!skipped.claim());
    }
}
