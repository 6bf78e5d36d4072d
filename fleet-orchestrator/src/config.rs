//! Orchestrator configuration
//!
//! Defines worker counts, per-category pool sizing and timeouts, the host slot
//! wait bound and the registry retention policy.

use anyhow::Context;
use fleet_runner::{PoolConfig, ResourceLimits, TaskServiceConfig};
use std::str::FromStr;
use std::time::Duration;

use crate::registry::Retention;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Worker loops pulling jobs from the queue
    pub job_workers: usize,

    /// Remote task service pools
    pub tasks: TaskServiceConfig,

    /// Longest time a job may wait for its host before failing
    pub host_slot_wait: Duration,

    /// How long a host stays held after its job timed out or was cancelled
    /// while the abandoned remote call is still returning
    pub release_grace: Duration,

    /// Run a connectivity probe on the fast pool before dispatching
    pub probe_hosts: bool,

    /// Eviction policy for finished jobs
    pub retention: Retention,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            job_workers: 8,
            tasks: TaskServiceConfig::default(),
            host_slot_wait: Duration::from_secs(30 * 60),
            release_grace: Duration::from_secs(60),
            probe_hosts: true,
            retention: Retention::default(),
        }
    }
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// All variables are optional:
    /// - FLEET_JOB_WORKERS (default: 8)
    /// - FLEET_JOB_POOL_SIZE (default: FLEET_JOB_WORKERS)
    /// - FLEET_FAST_POOL_MIN / FLEET_FAST_POOL_MAX (default: 2 / 16)
    /// - FLEET_FAST_IDLE_SECS (default: 30)
    /// - FLEET_INVENTORY_POOL_SIZE / FLEET_DEPLOYMENT_POOL_SIZE (default: 2)
    /// - FLEET_JOB_TIMEOUT_SECS (default: 1800)
    /// - FLEET_FAST_TIMEOUT_SECS (default: 15)
    /// - FLEET_INVENTORY_TIMEOUT_SECS (default: 60)
    /// - FLEET_DEPLOYMENT_TIMEOUT_SECS (default: 600)
    /// - FLEET_HOST_SLOT_WAIT_SECS (default: 1800)
    /// - FLEET_RELEASE_GRACE_SECS (default: 60)
    /// - FLEET_PROBE_HOSTS (default: true)
    /// - FLEET_JOB_RETENTION (default: 1000)
    /// - FLEET_JOB_TTL_SECS (default: 86400)
    /// - FLEET_MAX_CPU_PERCENT (default: 85)
    /// - FLEET_MIN_FREE_MEMORY_MB (default: 512)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let tasks = &defaults.tasks;

        let job_workers = env_or("FLEET_JOB_WORKERS", defaults.job_workers)?;
        let job_pool = env_or("FLEET_JOB_POOL_SIZE", job_workers)?;

        let fast_min = env_or("FLEET_FAST_POOL_MIN", tasks.fast.min_workers)?;
        let fast_max = env_or("FLEET_FAST_POOL_MAX", tasks.fast.max_workers)?;
        let fast_idle = env_secs("FLEET_FAST_IDLE_SECS", tasks.fast.idle_timeout)?;

        let tasks = TaskServiceConfig {
            fast: PoolConfig::elastic(
                fast_min,
                fast_max,
                fast_idle,
                env_secs("FLEET_FAST_TIMEOUT_SECS", tasks.fast.default_timeout)?,
            ),
            job: PoolConfig::fixed(
                job_pool,
                env_secs("FLEET_JOB_TIMEOUT_SECS", tasks.job.default_timeout)?,
            ),
            inventory: PoolConfig::fixed(
                env_or("FLEET_INVENTORY_POOL_SIZE", tasks.inventory.min_workers)?,
                env_secs("FLEET_INVENTORY_TIMEOUT_SECS", tasks.inventory.default_timeout)?,
            ),
            deployment: PoolConfig::fixed(
                env_or("FLEET_DEPLOYMENT_POOL_SIZE", tasks.deployment.min_workers)?,
                env_secs("FLEET_DEPLOYMENT_TIMEOUT_SECS", tasks.deployment.default_timeout)?,
            ),
            limits: ResourceLimits {
                max_cpu_percent: env_or("FLEET_MAX_CPU_PERCENT", tasks.limits.max_cpu_percent)?,
                min_free_memory_mb: env_or(
                    "FLEET_MIN_FREE_MEMORY_MB",
                    tasks.limits.min_free_memory_mb,
                )?,
            },
            sample_interval: tasks.sample_interval,
        };

        Ok(Self {
            job_workers,
            tasks,
            host_slot_wait: env_secs("FLEET_HOST_SLOT_WAIT_SECS", defaults.host_slot_wait)?,
            release_grace: env_secs("FLEET_RELEASE_GRACE_SECS", defaults.release_grace)?,
            probe_hosts: env_or("FLEET_PROBE_HOSTS", defaults.probe_hosts)?,
            retention: Retention {
                max_jobs: env_or("FLEET_JOB_RETENTION", defaults.retention.max_jobs)?,
                ttl: env_secs("FLEET_JOB_TTL_SECS", defaults.retention.ttl)?,
            },
        })
    }

    /// Sets the number of worker loops and the matching job pool size
    pub fn with_job_workers(mut self, workers: usize) -> Self {
        self.job_workers = workers;
        self.tasks.job.min_workers = workers;
        self.tasks.job.max_workers = workers;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.tasks.job.default_timeout = timeout;
        self
    }

    pub fn with_host_slot_wait(mut self, wait: Duration) -> Self {
        self.host_slot_wait = wait;
        self
    }

    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    pub fn with_probe_hosts(mut self, probe: bool) -> Self {
        self.probe_hosts = probe;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.job_workers == 0 {
            anyhow::bail!("job_workers must be greater than 0");
        }

        for category in fleet_runner::TaskCategory::ALL {
            let pool = self.tasks.pool(category);
            if pool.max_workers == 0 {
                anyhow::bail!("{} pool needs at least one worker", category);
            }
            if pool.min_workers > pool.max_workers {
                anyhow::bail!("{} pool minimum exceeds its maximum", category);
            }
            if pool.default_timeout.is_zero() {
                anyhow::bail!("{} pool timeout must be greater than 0", category);
            }
        }

        if self.tasks.fast.idle_timeout.is_zero() {
            anyhow::bail!("fast pool idle timeout must be greater than 0");
        }

        let cpu = self.tasks.limits.max_cpu_percent;
        if !(cpu > 0.0 && cpu <= 100.0) {
            anyhow::bail!("max_cpu_percent must be in (0, 100]");
        }

        if self.host_slot_wait.is_zero() {
            anyhow::bail!("host_slot_wait must be greater than 0");
        }

        if self.retention.max_jobs == 0 {
            anyhow::bail!("job retention must keep at least one job");
        }

        Ok(())
    }
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        _ => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> anyhow::Result<Duration> {
    env_or(name, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.job_workers, 8);
        assert_eq!(config.tasks.job.max_workers, 8);
        assert!(config.probe_hosts);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.job_workers = 0;
        assert!(config.validate().is_err());
        config.job_workers = 4;

        config.tasks.fast.min_workers = 20;
        assert!(config.validate().is_err());
        config.tasks.fast.min_workers = 2;

        config.tasks.limits.max_cpu_percent = 0.0;
        assert!(config.validate().is_err());
        config.tasks.limits.max_cpu_percent = 90.0;

        config.retention.max_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let config = Config::default()
            .with_job_workers(3)
            .with_job_timeout(Duration::from_secs(5))
            .with_probe_hosts(false)
            .with_host_slot_wait(Duration::from_secs(1))
            .with_release_grace(Duration::from_secs(2));
        assert_eq!(config.tasks.job.min_workers, 3);
        assert_eq!(config.release_grace, Duration::from_secs(2));
        assert_eq!(config.tasks.job.default_timeout, Duration::from_secs(5));
        assert!(!config.probe_hosts);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_parsing() {
        // Variable names unique to this test; the process environment is shared
        unsafe {
            std::env::set_var("FLEET_TEST_ENV_COUNT", " 12 ");
            std::env::set_var("FLEET_TEST_ENV_BAD", "many");
        }
        assert_eq!(env_or("FLEET_TEST_ENV_COUNT", 1usize).unwrap(), 12);
        assert_eq!(env_or("FLEET_TEST_ENV_UNSET", 7usize).unwrap(), 7);
        assert!(env_or("FLEET_TEST_ENV_BAD", 1usize).is_err());
        assert_eq!(
            env_secs("FLEET_TEST_ENV_COUNT", Duration::ZERO).unwrap(),
            Duration::from_secs(12)
        );
    }
}
