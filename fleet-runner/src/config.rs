//! Remote task service configuration
//!
//! One [`PoolConfig`] per task category. Fixed pools keep `min == max` workers
//! alive; elastic pools start at `min` and grow towards `max` while backlog
//! exists and the host has headroom.

use std::time::Duration;

use crate::service::{ResourceLimits, TaskCategory};

/// Sizing and timeout policy of one worker pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Workers kept alive even when idle
    pub min_workers: usize,

    /// Upper bound for elastic growth
    pub max_workers: usize,

    /// How long a surplus worker may sit idle before it exits
    pub idle_timeout: Duration,

    /// Timeout applied when the caller does not pass one
    pub default_timeout: Duration,
}

impl PoolConfig {
    /// Pool with a constant number of workers
    pub fn fixed(workers: usize, default_timeout: Duration) -> Self {
        Self {
            min_workers: workers,
            max_workers: workers,
            idle_timeout: Duration::from_secs(60),
            default_timeout,
        }
    }

    /// Pool that scales between `min` and `max` workers
    pub fn elastic(min: usize, max: usize, idle_timeout: Duration, default_timeout: Duration) -> Self {
        Self {
            min_workers: min,
            max_workers: max.max(min),
            idle_timeout,
            default_timeout,
        }
    }

    pub fn is_elastic(&self) -> bool {
        self.max_workers > self.min_workers
    }
}

/// Configuration of the whole remote task service
#[derive(Debug, Clone, PartialEq)]
pub struct TaskServiceConfig {
    /// Connectivity checks and other short probes
    pub fast: PoolConfig,

    /// Provisioning work; sized by the operator's concurrency ceiling
    pub job: PoolConfig,

    /// Inventory polling, isolated from provisioning
    pub inventory: PoolConfig,

    /// Agent version checks and deployments
    pub deployment: PoolConfig,

    /// Headroom required before the elastic pool may grow
    pub limits: ResourceLimits,

    /// Minimum time between two system resource samples
    pub sample_interval: Duration,
}

impl TaskServiceConfig {
    pub fn pool(&self, category: TaskCategory) -> &PoolConfig {
        match category {
            TaskCategory::Fast => &self.fast,
            TaskCategory::Job => &self.job,
            TaskCategory::Inventory => &self.inventory,
            TaskCategory::Deployment => &self.deployment,
        }
    }
}

impl Default for TaskServiceConfig {
    fn default() -> Self {
        Self {
            fast: PoolConfig::elastic(
                2,
                16,
                Duration::from_secs(30),
                Duration::from_secs(15),
            ),
            job: PoolConfig::fixed(8, Duration::from_secs(30 * 60)),
            inventory: PoolConfig::fixed(2, Duration::from_secs(60)),
            deployment: PoolConfig::fixed(2, Duration::from_secs(10 * 60)),
            limits: ResourceLimits::default(),
            sample_interval: Duration::from_secs(1),
        }
    }
}
