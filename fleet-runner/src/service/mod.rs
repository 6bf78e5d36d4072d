//! Remote task service
//!
//! Runs blocking remote calls on categorized thread pools and lets async
//! callers await them with a timeout and a cancellation token. A call that
//! overruns is abandoned rather than interrupted; see [`pool`] for how the
//! pool stays at strength while an abandoned thread is still stuck.

mod pool;
mod resources;

pub use pool::{PoolMetrics, ScalingState};
pub use resources::{ResourceLimits, ResourceProbe, ResourceSample, StaticProbe, SystemProbe};

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::TaskServiceConfig;
use pool::{Ticket, WorkerPool};

/// Isolation class of a remote task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    /// Short checks such as connectivity probes
    Fast,
    /// Provisioning operations
    Job,
    Inventory,
    Deployment,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 4] = [
        TaskCategory::Fast,
        TaskCategory::Job,
        TaskCategory::Inventory,
        TaskCategory::Deployment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Fast => "fast",
            TaskCategory::Job => "job",
            TaskCategory::Inventory => "inventory",
            TaskCategory::Deployment => "deployment",
        }
    }

    fn index(&self) -> usize {
        match self {
            TaskCategory::Fast => 0,
            TaskCategory::Job => 1,
            TaskCategory::Inventory => 2,
            TaskCategory::Deployment => 3,
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("{category} task timed out after {timeout:?}")]
    TimedOut {
        category: TaskCategory,
        timeout: Duration,
    },

    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("{0} pool is shut down")]
    Shutdown(TaskCategory),
}

/// Handed to every blocking call
pub struct TaskContext {
    category: TaskCategory,
    ticket: Arc<Ticket>,
}

impl TaskContext {
    pub fn category(&self) -> TaskCategory {
        self.category
    }

    /// True once the caller stopped waiting; long calls may bail out early
    pub fn is_discarded(&self) -> bool {
        self.ticket.is_discarded()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskServiceMetrics {
    pub pools: Vec<PoolMetrics>,
    pub resources: ResourceSample,
}

/// Resolves once the call behind a task is no longer running
///
/// Fires when the call returns, even if nobody waits for its result any more,
/// or when the task is dropped without ever being run.
#[derive(Debug)]
pub struct Settled(oneshot::Receiver<()>);

impl Settled {
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

/// Discards the ticket when the awaiting future goes away early
struct DiscardGuard {
    pool: Arc<WorkerPool>,
    ticket: Arc<Ticket>,
}

impl Drop for DiscardGuard {
    fn drop(&mut self) {
        self.pool.discard(&self.ticket);
    }
}

pub struct RemoteTaskService {
    pools: [Arc<WorkerPool>; 4],
    probe: Arc<dyn ResourceProbe>,
}

impl RemoteTaskService {
    pub fn new(config: TaskServiceConfig) -> Self {
        let probe: Arc<dyn ResourceProbe> = Arc::new(SystemProbe::new(config.sample_interval));
        Self::with_probe(config, probe)
    }

    pub fn with_probe(config: TaskServiceConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        let pools = TaskCategory::ALL.map(|category| {
            WorkerPool::start(
                category,
                config.pool(category).clone(),
                config.limits,
                Arc::clone(&probe),
            )
        });
        Self { pools, probe }
    }

    fn pool(&self, category: TaskCategory) -> &Arc<WorkerPool> {
        &self.pools[category.index()]
    }

    /// Runs `call` on the category's pool; `None` uses the pool's default timeout
    pub async fn run<F, T>(
        &self,
        category: TaskCategory,
        timeout: Option<Duration>,
        call: F,
    ) -> Result<T, TaskError>
    where
        F: FnOnce(&TaskContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.run_with_cancel(category, timeout, &CancellationToken::new(), call)
            .await
    }

    /// Like [`run`](Self::run), resolving as `Cancelled` once `cancel` fires
    ///
    /// The timeout counts from the moment a worker picks the task up, so time
    /// spent queued behind other tasks does not eat into it.
    pub async fn run_with_cancel<F, T>(
        &self,
        category: TaskCategory,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, TaskError>
    where
        F: FnOnce(&TaskContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.run_settled(category, timeout, cancel, call).await.0
    }

    /// Like [`run_with_cancel`](Self::run_with_cancel), also returning a
    /// [`Settled`] signal
    ///
    /// After a timeout or cancellation the call may still be running on its
    /// abandoned worker; the signal tells when it has actually returned.
    pub async fn run_settled<F, T>(
        &self,
        category: TaskCategory,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        call: F,
    ) -> (Result<T, TaskError>, Settled)
    where
        F: FnOnce(&TaskContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (settled_tx, settled_rx) = oneshot::channel::<()>();
        let settled = Settled(settled_rx);
        if cancel.is_cancelled() {
            return (Err(TaskError::Cancelled), settled);
        }

        let pool = self.pool(category);
        let timeout = timeout.unwrap_or(pool.config().default_timeout);
        let ticket = Ticket::new();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (result_tx, result_rx) = oneshot::channel::<Result<T, String>>();

        let context = TaskContext {
            category,
            ticket: Arc::clone(&ticket),
        };
        // Dropping the closure unrun also closes `settled_tx`
        let work = Box::new(move || {
            let _ = started_tx.send(());
            let outcome = catch_unwind(AssertUnwindSafe(|| call(&context))).map_err(panic_message);
            if context.ticket.finish() {
                let _ = result_tx.send(outcome);
            }
            let _ = settled_tx.send(());
        });

        if !pool.submit(Arc::clone(&ticket), work) {
            return (Err(TaskError::Shutdown(category)), settled);
        }
        let _guard = DiscardGuard {
            pool: Arc::clone(pool),
            ticket,
        };

        let completion = async {
            if started_rx.await.is_err() {
                return Err(TaskError::Shutdown(category));
            }
            match tokio::time::timeout(timeout, result_rx).await {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(message))) => Err(TaskError::Panicked(message)),
                Ok(Err(_)) => Err(TaskError::Shutdown(category)),
                Err(_) => {
                    warn!("{} task exceeded its {:?} timeout", category, timeout);
                    Err(TaskError::TimedOut { category, timeout })
                }
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
            outcome = completion => outcome,
        };
        (outcome, settled)
    }

    pub fn metrics(&self) -> TaskServiceMetrics {
        TaskServiceMetrics {
            pools: self.pools.iter().map(|pool| pool.metrics()).collect(),
            resources: self.probe.sample(),
        }
    }

    pub fn pool_metrics(&self, category: TaskCategory) -> PoolMetrics {
        self.pool(category).metrics()
    }

    /// Stops all pools; queued tasks resolve as [`TaskError::Shutdown`]
    pub fn shutdown(&self) {
        for pool in &self.pools {
            pool.shutdown();
        }
    }
}

impl Drop for RemoteTaskService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
