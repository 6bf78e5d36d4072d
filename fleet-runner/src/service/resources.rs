//! System resource sampling
//!
//! The elastic pool only grows while the control plane host has CPU and
//! memory to spare. Sampling goes through the [`ResourceProbe`] trait so tests
//! can pin the numbers.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use sysinfo::System;

/// Point-in-time view of host resources
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Global CPU usage, 0-100
    pub cpu_percent: f32,
    pub available_memory_mb: u64,
}

impl ResourceSample {
    /// A host doing nothing, with plenty of memory
    pub fn idle() -> Self {
        Self {
            cpu_percent: 0.0,
            available_memory_mb: u64::MAX,
        }
    }
}

/// Headroom required for elastic growth
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_cpu_percent: f32,
    pub min_free_memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 85.0,
            min_free_memory_mb: 512,
        }
    }
}

impl ResourceLimits {
    pub fn permits_growth(&self, sample: &ResourceSample) -> bool {
        sample.cpu_percent < self.max_cpu_percent
            && sample.available_memory_mb >= self.min_free_memory_mb
    }
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Probe backed by `sysinfo`, refreshed at most once per interval
pub struct SystemProbe {
    interval: Duration,
    state: Mutex<ProbeState>,
}

struct ProbeState {
    system: System,
    last: Option<(Instant, ResourceSample)>,
}

impl SystemProbe {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(ProbeState {
                system: System::new(),
                last: None,
            }),
        }
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceSample {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((taken, sample)) = state.last {
            if taken.elapsed() < self.interval {
                return sample;
            }
        }

        state.system.refresh_cpu_usage();
        state.system.refresh_memory();
        let sample = ResourceSample {
            cpu_percent: state.system.global_cpu_usage(),
            available_memory_mb: state.system.available_memory() / (1024 * 1024),
        };
        state.last = Some((Instant::now(), sample));
        sample
    }
}

/// Probe returning a caller-controlled sample
pub struct StaticProbe {
    sample: Mutex<ResourceSample>,
}

impl StaticProbe {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: ResourceSample) {
        *self.sample.lock().unwrap_or_else(PoisonError::into_inner) = sample;
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceSample {
        *self.sample.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
