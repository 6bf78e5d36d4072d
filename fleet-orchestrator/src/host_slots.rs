//! Host slot serializer
//!
//! At most one job holds a host at a time. Waiters queue per host and are
//! granted the slot strictly in the order they were enqueued.
//!
//! Acquisition is split in two steps so callers can fix their place in line
//! synchronously and suspend afterwards: [`HostSlots::enqueue`] takes a
//! ticket, [`SlotWaiter::acquire`] waits for it. Dropping a waiter at any
//! point (including mid-await) removes it from the queue, and if the slot had
//! already been handed to it, passes the slot on.

use fleet_core::domain::job::JobId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    ticket: u64,
    job_id: JobId,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct SlotState {
    holder: Option<(u64, JobId)>,
    waiters: VecDeque<Waiter>,
}

/// Occupancy of one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSlotSnapshot {
    pub host: String,
    pub holder: Option<JobId>,
    pub waiting: usize,
}

#[derive(Default)]
pub struct HostSlots {
    slots: Mutex<HashMap<String, SlotState>>,
    next_ticket: AtomicU64,
}

impl HostSlots {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SlotState>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a place in `host`'s queue without suspending
    ///
    /// The slot is granted immediately when the host is free and nobody is
    /// waiting.
    pub fn enqueue(self: &Arc<Self>, host: &str, job_id: JobId) -> SlotWaiter {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let key = host.to_lowercase();
        let mut slots = self.lock();
        let slot = slots.entry(key.clone()).or_default();

        let grant = if slot.holder.is_none() && slot.waiters.is_empty() {
            slot.holder = Some((ticket, job_id));
            None
        } else {
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(Waiter {
                ticket,
                job_id,
                grant: tx,
            });
            debug!(
                "Job {} queued for host {} ({} waiting)",
                job_id,
                key,
                slot.waiters.len()
            );
            Some(rx)
        };

        SlotWaiter {
            slots: Arc::clone(self),
            host: key,
            ticket,
            job_id,
            grant,
            armed: true,
        }
    }

    /// Suspends until `job_id` holds `host`
    pub async fn acquire(self: &Arc<Self>, host: &str, job_id: JobId) -> HostSlotGuard {
        self.enqueue(host, job_id).acquire().await
    }

    /// Like [`acquire`](Self::acquire), giving up after `wait`
    pub async fn acquire_timeout(
        self: &Arc<Self>,
        host: &str,
        job_id: JobId,
        wait: Duration,
    ) -> Option<HostSlotGuard> {
        self.enqueue(host, job_id).acquire_timeout(wait).await
    }

    /// Takes the slot only if the host is free and nobody is queued
    pub fn try_acquire(self: &Arc<Self>, host: &str, job_id: JobId) -> Option<HostSlotGuard> {
        let key = host.to_lowercase();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.lock();
        let slot = slots.entry(key.clone()).or_default();
        if slot.holder.is_some() || !slot.waiters.is_empty() {
            return None;
        }
        slot.holder = Some((ticket, job_id));
        Some(HostSlotGuard {
            slots: Arc::clone(self),
            host: key,
            ticket,
            job_id,
        })
    }

    pub fn queue_depth(&self, host: &str) -> usize {
        self.lock()
            .get(&host.to_lowercase())
            .map_or(0, |slot| slot.waiters.len())
    }

    pub fn holder(&self, host: &str) -> Option<JobId> {
        self.lock()
            .get(&host.to_lowercase())
            .and_then(|slot| slot.holder.map(|(_, job_id)| job_id))
    }

    /// Every host seen so far, sorted by name
    pub fn snapshot(&self) -> Vec<HostSlotSnapshot> {
        let slots = self.lock();
        let mut hosts: Vec<HostSlotSnapshot> = slots
            .iter()
            .map(|(host, slot)| HostSlotSnapshot {
                host: host.clone(),
                holder: slot.holder.map(|(_, job_id)| job_id),
                waiting: slot.waiters.len(),
            })
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        hosts
    }

    /// Frees the slot held by `ticket` and grants it to the oldest live waiter
    fn release(&self, host: &str, ticket: u64) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(host) else {
            return;
        };
        if slot.holder.map(|(held, _)| held) != Some(ticket) {
            return;
        }
        slot.holder = None;

        while let Some(waiter) = slot.waiters.pop_front() {
            slot.holder = Some((waiter.ticket, waiter.job_id));
            if waiter.grant.send(()).is_ok() {
                debug!("Host {} handed to job {}", host, waiter.job_id);
                return;
            }
            // Receiver already gone; its owner is being dropped
            slot.holder = None;
        }
    }

    /// Removes a waiter that will never be polled again
    fn withdraw(&self, host: &str, ticket: u64) {
        let held = {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(host) else {
                return;
            };
            let before = slot.waiters.len();
            slot.waiters.retain(|waiter| waiter.ticket != ticket);
            if slot.waiters.len() != before {
                return;
            }
            slot.holder.map(|(held, _)| held) == Some(ticket)
        };
        // Granted between the send and our drop: pass it on
        if held {
            self.release(host, ticket);
        }
    }
}

/// A place in a host's queue
pub struct SlotWaiter {
    slots: Arc<HostSlots>,
    host: String,
    ticket: u64,
    job_id: JobId,
    grant: Option<oneshot::Receiver<()>>,
    armed: bool,
}

impl SlotWaiter {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn acquire(mut self) -> HostSlotGuard {
        if let Some(grant) = self.grant.take() {
            // The sender is only dropped unsent when the waiter was withdrawn,
            // which cannot happen while this future is alive.
            let _ = grant.await;
        }
        self.armed = false;
        HostSlotGuard {
            slots: Arc::clone(&self.slots),
            host: self.host.clone(),
            ticket: self.ticket,
            job_id: self.job_id,
        }
    }

    pub async fn acquire_timeout(self, wait: Duration) -> Option<HostSlotGuard> {
        tokio::time::timeout(wait, self.acquire()).await.ok()
    }
}

impl Drop for SlotWaiter {
    fn drop(&mut self) {
        if self.armed {
            self.slots.withdraw(&self.host, self.ticket);
        }
    }
}

/// Exclusive hold on a host; released on drop
pub struct HostSlotGuard {
    slots: Arc<HostSlots>,
    host: String,
    ticket: u64,
    job_id: JobId,
}

impl HostSlotGuard {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Drop for HostSlotGuard {
    fn drop(&mut self) {
        self.slots.release(&self.host, self.ticket);
    }
}
