//! Job service
//!
//! Entry point of the orchestrator. Submissions are validated and recorded
//! synchronously; a fixed set of worker loops then pulls job ids from a FIFO
//! queue and dispatches them:
//!
//! - leaf jobs take their place in the host's slot queue and continue on a task
//!   of their own; the remote call runs on the `Job` pool of the remote task
//!   service and streams decoded output into the registry
//! - composite parents hand their ordered children to a driver task that
//!   enqueues one step at a time
//!
//! Every job gets a cancellation token; children of a composite get child
//! tokens of their parent's, so cancelling the parent reaches the running step.

mod composite;
mod worker;

use fleet_core::domain::job::{JobId, JobState};
use fleet_core::domain::operation::Operation;
use fleet_core::domain::resource::ResourceSpec;
use fleet_core::dto::job::{CompositeStep, JobFilter, JobSummary, JobView};
use fleet_runner::{RemoteExecutor, RemoteTaskService, TaskServiceMetrics};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::JobError;
use crate::host_slots::{HostSlotSnapshot, HostSlots};
use crate::observer::JobObserver;
use crate::registry::{JobRegistry, JobStateCounts};
use crate::validation::{ValidatedJob, Validator};

/// Point-in-time view of the whole control plane
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    /// Jobs waiting for a worker loop
    pub queue_depth: usize,
    pub jobs: JobStateCounts,
    pub tasks: TaskServiceMetrics,
    pub hosts: Vec<HostSlotSnapshot>,
}

pub(crate) struct Inner {
    config: Config,
    registry: Arc<JobRegistry>,
    slots: Arc<HostSlots>,
    tasks: Arc<RemoteTaskService>,
    executor: Arc<dyn RemoteExecutor>,
    validator: Validator,
    queue_tx: mpsc::UnboundedSender<JobId>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>,
    queued: AtomicUsize,
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Inner {
    fn tokens(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn token(&self, id: JobId) -> CancellationToken {
        self.tokens().get(&id).cloned().unwrap_or_default()
    }

    fn forget(&self, id: JobId) {
        self.tokens().remove(&id);
    }

    fn enqueue(&self, id: JobId) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        if self.queue_tx.send(id).is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            warn!("Job queue closed, dropping job {}", id);
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }
}

/// Submission and status API of the orchestrator
#[derive(Clone)]
pub struct JobService {
    inner: Arc<Inner>,
}

impl JobService {
    /// Creates a service with its own remote task service and no inventory
    pub fn new(config: Config, executor: Arc<dyn RemoteExecutor>) -> Self {
        let tasks = Arc::new(RemoteTaskService::new(config.tasks.clone()));
        Self::with_parts(config, executor, tasks, Validator::new())
    }

    pub fn with_parts(
        config: Config,
        executor: Arc<dyn RemoteExecutor>,
        tasks: Arc<RemoteTaskService>,
        validator: Validator,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(JobRegistry::new(config.retention));
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                slots: HostSlots::new(),
                tasks,
                executor,
                validator,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                queued: AtomicUsize::new(0),
                tokens: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                handles: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn host_slots(&self) -> &Arc<HostSlots> {
        &self.inner.slots
    }

    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) {
        self.inner.registry.subscribe(observer);
    }

    /// Starts the worker loops and the eviction janitor
    ///
    /// Must be called from within a tokio runtime. Jobs submitted before
    /// `start` wait in the queue.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        for index in 0..self.inner.config.job_workers {
            let handle = tokio::spawn(worker::run(Arc::clone(&self.inner), index));
            self.inner.track(handle);
        }
        let janitor = tokio::spawn(janitor(Arc::clone(&self.inner)));
        self.inner.track(janitor);

        info!(
            "Job service started with {} workers",
            self.inner.config.job_workers
        );
    }

    /// Validates and records a job; it runs once a worker picks it up
    ///
    /// A `managed_deployment` becomes a composite job with one child per step.
    pub fn submit(
        &self,
        operation: Operation,
        target_host: &str,
        parameters: serde_json::Value,
    ) -> Result<JobId, JobError> {
        self.ensure_open()?;
        let validated = self
            .inner
            .validator
            .validate(operation, Some(target_host), &parameters)?;

        if let ResourceSpec::ManagedDeployment(deployment) = &validated.spec {
            let steps: Vec<CompositeStep> = deployment
                .clone()
                .into_steps()
                .iter()
                .map(|spec| CompositeStep::from_spec(&validated.host, spec))
                .collect();
            let children = self.inner.validator.validate_composite(&steps)?;
            return self.create_composite(
                Some(validated.host.clone()),
                validated.spec.to_parameters(),
                validated.claims,
                children,
            );
        }

        let id = self.inner.registry.create_claimed(
            operation,
            Some(validated.host.clone()),
            validated.spec.to_parameters(),
            validated.claims,
        )?;
        self.inner
            .tokens()
            .insert(id, CancellationToken::new());
        self.inner.enqueue(id);

        info!("Job {} submitted: {} on {}", id, operation, validated.host);
        Ok(id)
    }

    /// Records a parent job plus one child per step, run strictly in order
    pub fn submit_composite(&self, steps: Vec<CompositeStep>) -> Result<JobId, JobError> {
        self.ensure_open()?;
        let children = self.inner.validator.validate_composite(&steps)?;

        let first_host = children.first().map(|child| child.host.to_lowercase());
        let host = first_host.filter(|host| {
            children
                .iter()
                .all(|child| child.host.eq_ignore_ascii_case(host))
        });
        let claims = children
            .iter()
            .flat_map(|child| child.claims.iter().cloned())
            .collect();
        let parameters = serde_json::json!({ "steps": steps });

        self.create_composite(host, parameters, claims, children)
    }

    fn create_composite(
        &self,
        host: Option<String>,
        parameters: serde_json::Value,
        claims: Vec<crate::registry::HostClaim>,
        children: Vec<ValidatedJob>,
    ) -> Result<JobId, JobError> {
        let registry = &self.inner.registry;
        let parent = registry.create_claimed(Operation::ManagedDeployment, host, parameters, claims)?;
        let parent_token = CancellationToken::new();

        let mut tokens = Vec::with_capacity(children.len() + 1);
        tokens.push((parent, parent_token.clone()));
        for child in children {
            let id = registry.create(
                child.operation(),
                Some(child.host),
                child.spec.to_parameters(),
                Some(parent),
            )?;
            registry.link_child(parent, id)?;
            tokens.push((id, parent_token.child_token()));
        }
        let steps = tokens.len() - 1;
        self.inner.tokens().extend(tokens);
        self.inner.enqueue(parent);

        info!("Composite job {} submitted with {} steps", parent, steps);
        Ok(parent)
    }

    pub fn get(&self, id: JobId) -> Result<JobView, JobError> {
        Ok(self.inner.registry.get(id)?)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<JobSummary> {
        self.inner.registry.list(filter)
    }

    /// Suspends until the job is terminal and returns its final view
    pub async fn wait(&self, id: JobId) -> Result<JobView, JobError> {
        Ok(self.inner.registry.wait_terminal(id).await?)
    }

    /// Requests cancellation; a no-op for jobs that already finished
    ///
    /// Pending jobs are cancelled immediately. A running job is cancelled by
    /// its worker: a host slot wait is abandoned, a remote call is discarded.
    pub fn cancel(&self, id: JobId) -> Result<(), JobError> {
        let job = self.inner.registry.snapshot(id)?;
        if job.is_terminal() {
            debug!("Job {} already finished as {}", id, job.state);
            return Ok(());
        }

        if let Some(token) = self.inner.tokens().get(&id) {
            token.cancel();
        }

        let registry = &self.inner.registry;
        if job.children.is_empty() {
            registry.cancel_if_pending(id, "cancelled by request")?;
        } else {
            for child in &job.children {
                registry.cancel_if_pending(*child, "cancelled by request")?;
            }
        }

        info!("Cancellation requested for job {}", id);
        Ok(())
    }

    pub fn metrics(&self) -> ServiceMetrics {
        ServiceMetrics {
            queue_depth: self.inner.queued.load(Ordering::Relaxed),
            jobs: self.inner.registry.counts(),
            tasks: self.inner.tasks.metrics(),
            hosts: self.inner.slots.snapshot(),
        }
    }

    /// Stops the service
    ///
    /// Workers stop pulling, in-flight jobs are cancelled, task pools shut
    /// down and every job still pending ends as Cancelled.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down job service");
        self.inner.shutdown.cancel();

        for token in self.inner.tokens().values() {
            token.cancel();
        }
        self.inner.tasks.shutdown();

        // Finishing jobs may still hand their host slot to a release task
        loop {
            let handles: Vec<JoinHandle<()>> = self
                .inner
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Job service task failed: {}", e);
                }
            }
        }

        let pending = self.inner.registry.list(&JobFilter {
            state: Some(JobState::Pending),
            ..Default::default()
        });
        for job in pending {
            // Parents settle through their children
            if let Err(e) = self
                .inner
                .registry
                .cancel_if_pending(job.id, "job service shut down")
            {
                debug!("Pending job {} left to aggregation: {}", job.id, e);
            }
        }
        self.inner.tokens().clear();
        info!("Job service stopped");
    }

    fn ensure_open(&self) -> Result<(), JobError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JobError::Shutdown);
        }
        Ok(())
    }
}

/// Periodically evicts finished jobs
async fn janitor(inner: Arc<Inner>) {
    let period = inner
        .config
        .retention
        .ttl
        .clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {
                inner.registry.evict_expired();
            }
        }
    }
}
