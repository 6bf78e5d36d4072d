//! Job worker loop
//!
//! Pulls job ids off the queue and fixes each leaf job's place on its host's
//! slot queue while still holding the queue lock, so per-host order is dequeue
//! order. The job itself then runs on its own task; a worker loop never waits
//! on a host, and concurrency across hosts is bounded by the `Job` pool alone.

use chrono::Utc;
use fleet_core::domain::envelope::{JobRequest, JobResultEnvelope, RequestMetadata, ResultStatus};
use fleet_core::domain::job::{FailureKind, Job, JobFailure, JobId, JobState};
use fleet_core::domain::log::LogEntry;
use fleet_runner::{
    ExecutorError, OutputChunk, OutputSink, OutputStream, RemoteCommand, Settled, StreamDecoder,
    TaskCategory, TaskError,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Inner, composite};
use crate::error::JobError;
use crate::host_slots::{HostSlotGuard, SlotWaiter};
use crate::registry::JobRegistry;

enum Dispatch {
    Leaf {
        job: Job,
        host: String,
        waiter: SlotWaiter,
    },
    Composite {
        parent: JobId,
        children: Vec<JobId>,
    },
}

/// How a remote call ended when it did not fail outright
enum Outcome {
    Completed,
    Partial(JobFailure),
}

pub(super) async fn run(inner: Arc<Inner>, index: usize) {
    debug!("Job worker {} started", index);

    while let Some(dispatch) = next_job(&inner).await {
        match dispatch {
            Dispatch::Leaf { job, host, waiter } => {
                let handle = tokio::spawn(execute(Arc::clone(&inner), job, host, waiter));
                inner.track(handle);
            }
            Dispatch::Composite { parent, children } => {
                let handle = tokio::spawn(composite::drive(Arc::clone(&inner), parent, children));
                inner.track(handle);
            }
        }
    }

    debug!("Job worker {} stopped", index);
}

async fn next_job(inner: &Arc<Inner>) -> Option<Dispatch> {
    loop {
        let mut queue = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return None,
            queue = inner.queue_rx.lock() => queue,
        };
        let id = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return None,
            id = queue.recv() => match id {
                Some(id) => id,
                None => return None,
            },
        };
        inner.queued.fetch_sub(1, Ordering::Relaxed);

        if let Some(dispatch) = prepare(inner, id) {
            return Some(dispatch);
        }
    }
}

fn prepare(inner: &Arc<Inner>, id: JobId) -> Option<Dispatch> {
    let job = match inner.registry.snapshot(id) {
        Ok(job) => job,
        Err(_) => {
            debug!("Job {} was evicted before dispatch", id);
            inner.forget(id);
            return None;
        }
    };

    if job.is_terminal() {
        debug!("Skipping job {}, already {}", id, job.state);
        inner.forget(id);
        for child in &job.children {
            inner.forget(*child);
        }
        return None;
    }

    if job.operation.is_composite() {
        return Some(Dispatch::Composite {
            parent: id,
            children: job.children,
        });
    }

    let Some(host) = job.target_host.clone() else {
        let failure = JobFailure::new(FailureKind::Internal, "job has no target host");
        if let Err(e) = inner.registry.transition(id, JobState::Failed, Some(failure)) {
            warn!("Failed to record missing host for job {}: {}", id, e);
        }
        inner.forget(id);
        return None;
    };

    let waiter = inner.slots.enqueue(&host, id);
    Some(Dispatch::Leaf { job, host, waiter })
}

async fn execute(inner: Arc<Inner>, job: Job, host: String, waiter: SlotWaiter) {
    let id = job.id;
    let token = inner.token(id);

    // Cancelled between dequeue and now; dropping the waiter leaves the queue
    if let Err(e) = inner.registry.transition(id, JobState::Running, None) {
        debug!("Job {} not started: {}", id, e);
        inner.forget(id);
        return;
    }
    info!("Starting job {} ({} on {})", id, job.operation, host);

    let (state, failure) = match dispatch(&inner, &job, &host, waiter, &token).await {
        Ok(Outcome::Completed) => {
            info!("Job {} completed", id);
            (JobState::Completed, None)
        }
        Ok(Outcome::Partial(failure)) => {
            warn!("Job {} partially completed: {}", id, failure.message);
            (JobState::Partial, Some(failure))
        }
        Err(e @ (JobError::Cancelled(_) | JobError::Shutdown)) => {
            info!("Job {} cancelled: {}", id, e);
            (JobState::Cancelled, Some(e.to_failure()))
        }
        Err(e) => {
            error!("Job {} failed: {}", id, e);
            (JobState::Failed, Some(e.to_failure()))
        }
    };

    if let Err(e) = inner.registry.transition(id, state, failure) {
        warn!("Failed to record final state of job {}: {}", id, e);
    }
    inner.forget(id);
}

/// Runs one leaf job while holding its host slot
///
/// The slot guard lives for the whole call and is released on every return,
/// except after a timeout or cancellation: the abandoned call may still be
/// talking to the host, so the slot is kept until it returns.
async fn dispatch(
    inner: &Arc<Inner>,
    job: &Job,
    host: &str,
    waiter: SlotWaiter,
    token: &CancellationToken,
) -> Result<Outcome, JobError> {
    let wait = inner.config.host_slot_wait;
    let granted = tokio::select! {
        biased;
        _ = token.cancelled() => {
            return Err(JobError::Cancelled("cancelled while waiting for host".to_string()));
        }
        granted = waiter.acquire_timeout(wait) => granted,
    };
    let Some(slot) = granted else {
        return Err(JobError::HostUnavailable {
            host: host.to_string(),
            reason: format!("slot not granted within {:?}", wait),
        });
    };
    debug!("Job {} holds host {}", job.id, host);

    if inner.config.probe_hosts {
        probe(inner, host, token).await?;
    }

    let correlation_id = job.id.to_string();
    let request = JobRequest {
        operation: job.operation,
        resource_spec: job.parameters.clone(),
        correlation_id: correlation_id.clone(),
        metadata: RequestMetadata {
            target_host: job.target_host.clone(),
            submitted_at: job.created_at,
            dispatched_at: Utc::now(),
            parent_job_id: job.parent_id,
        },
    };
    let payload = request
        .to_payload()
        .map_err(|e| JobError::Internal(format!("cannot serialize request: {}", e)))?;
    let command = RemoteCommand {
        host: host.to_string(),
        operation: job.operation.to_string(),
        payload,
    };

    let (sink, mut chunks) = OutputSink::channel();
    let executor = Arc::clone(&inner.executor);
    let remote = inner.tasks.run_settled(TaskCategory::Job, None, token, move |_| {
        executor.execute(&command, &sink)
    });
    tokio::pin!(remote);

    let mut collector = OutputCollector::new(&inner.registry, job.id);
    let mut open = true;
    let (result, settled) = loop {
        tokio::select! {
            chunk = chunks.recv(), if open => match chunk {
                Some(chunk) => collector.absorb(chunk),
                None => open = false,
            },
            result = &mut remote => break result,
        }
    };
    while let Ok(chunk) = chunks.try_recv() {
        collector.absorb(chunk);
    }
    drop(chunks);
    let envelope = collector.finish();

    if matches!(result, Err(TaskError::TimedOut { .. } | TaskError::Cancelled)) {
        release_when_settled(inner, job.id, slot, settled);
    }

    let exit_code = match result {
        Ok(Ok(code)) => code,
        Ok(Err(ExecutorError::Unreachable { host, reason })) => {
            return Err(JobError::HostUnavailable { host, reason });
        }
        Ok(Err(ExecutorError::Spawn(e))) => {
            return Err(JobError::HostUnavailable {
                host: host.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(Err(e)) => return Err(JobError::RemoteProtocol(e.to_string())),
        Err(e) => return Err(task_failure(e)),
    };

    interpret(&inner.registry, job.id, host, &correlation_id, exit_code, envelope)
}

/// Hands the slot on once the abandoned call returns, or after the grace period
fn release_when_settled(inner: &Arc<Inner>, id: JobId, slot: HostSlotGuard, settled: Settled) {
    let grace = inner.config.release_grace;
    let shutdown = inner.shutdown.clone();
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = settled.wait() => {
                debug!("Abandoned call of job {} returned, releasing {}", id, slot.host());
            }
            _ = tokio::time::sleep(grace) => {
                warn!(
                    "Abandoned call of job {} still running after {:?}, releasing {}",
                    id, grace, slot.host()
                );
            }
            _ = shutdown.cancelled() => {}
        }
        drop(slot);
    });
    inner.track(handle);
}

/// Connectivity check on the fast pool
async fn probe(inner: &Arc<Inner>, host: &str, token: &CancellationToken) -> Result<(), JobError> {
    let executor = Arc::clone(&inner.executor);
    let target = host.to_string();
    let outcome = inner
        .tasks
        .run_with_cancel(TaskCategory::Fast, None, token, move |_| executor.probe(&target))
        .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(JobError::HostUnavailable {
            host: host.to_string(),
            reason: e.to_string(),
        }),
        Err(TaskError::TimedOut { timeout, .. }) => Err(JobError::HostUnavailable {
            host: host.to_string(),
            reason: format!("probe timed out after {:?}", timeout),
        }),
        Err(e) => Err(task_failure(e)),
    }
}

/// Maps the agent's answer onto the job's outcome
fn interpret(
    registry: &JobRegistry,
    id: JobId,
    host: &str,
    correlation_id: &str,
    exit_code: i32,
    envelope: Option<JobResultEnvelope>,
) -> Result<Outcome, JobError> {
    let Some(envelope) = envelope else {
        return Err(JobError::RemoteProtocol(format!(
            "remote command exited with code {} without a result envelope",
            exit_code
        )));
    };

    if let Err(e) = envelope.verify_correlation(correlation_id) {
        error!("Protocol alert from host {} for job {}: {}", host, id, e);
        return Err(JobError::RemoteProtocol(e.to_string()));
    }

    for line in envelope.logs {
        if let Err(e) = registry.append_output(id, LogEntry::info(line)) {
            debug!("Dropping log line for job {}: {}", id, e);
        }
    }
    if !envelope.data.is_null() {
        if let Err(e) = registry.record_result(id, envelope.data) {
            debug!("Dropping result for job {}: {}", id, e);
        }
    }

    match envelope.status {
        ResultStatus::Success => {
            if exit_code != 0 {
                warn!(
                    "Job {} reported success but the remote command exited with {}",
                    id, exit_code
                );
                let note = format!("remote command exited with {} after reporting success", exit_code);
                if let Err(e) = registry.append_output(id, LogEntry::warning(note)) {
                    debug!("Dropping log line for job {}: {}", id, e);
                }
            }
            Ok(Outcome::Completed)
        }
        ResultStatus::Partial => Ok(Outcome::Partial(
            JobError::remote_execution(envelope.code, envelope.message).to_failure(),
        )),
        ResultStatus::Error => Err(JobError::remote_execution(envelope.code, envelope.message)),
    }
}

fn task_failure(error: TaskError) -> JobError {
    match error {
        TaskError::TimedOut { timeout, .. } => JobError::RemoteTimeout(timeout),
        TaskError::Cancelled => JobError::Cancelled("cancelled while running".to_string()),
        TaskError::Panicked(message) => {
            JobError::Internal(format!("remote call panicked: {}", message))
        }
        TaskError::Shutdown(_) => JobError::Shutdown,
    }
}

/// Decodes both output streams into the job's log
struct OutputCollector<'a> {
    registry: &'a JobRegistry,
    job_id: JobId,
    stdout: StreamDecoder,
    stderr: StreamDecoder,
    envelope: Option<JobResultEnvelope>,
}

impl<'a> OutputCollector<'a> {
    fn new(registry: &'a JobRegistry, job_id: JobId) -> Self {
        Self {
            registry,
            job_id,
            stdout: StreamDecoder::new(),
            stderr: StreamDecoder::new(),
            envelope: None,
        }
    }

    fn absorb(&mut self, chunk: OutputChunk) {
        match chunk.stream {
            OutputStream::Stdout => {
                let lines: Vec<_> = self.stdout.push(&chunk.bytes).collect();
                for line in lines {
                    self.stdout_line(line.text, line.result);
                }
            }
            OutputStream::Stderr => {
                let lines: Vec<_> = self.stderr.push(&chunk.bytes).collect();
                for line in lines {
                    self.append(LogEntry::error(line.text));
                }
            }
        }
    }

    fn stdout_line(&mut self, text: String, result: Option<JobResultEnvelope>) {
        match result {
            Some(envelope) => {
                if self.envelope.is_some() {
                    warn!("Job {} produced more than one result envelope; keeping the last", self.job_id);
                    self.append(LogEntry::warning("duplicate result envelope, keeping the last"));
                }
                self.envelope = Some(envelope);
            }
            None => self.append(LogEntry::info(text)),
        }
    }

    fn append(&self, entry: LogEntry) {
        if let Err(e) = self.registry.append_output(self.job_id, entry) {
            debug!("Dropping output for job {}: {}", self.job_id, e);
        }
    }

    /// Flushes both decoders and returns the result envelope, if one arrived
    fn finish(mut self) -> Option<JobResultEnvelope> {
        let lines: Vec<_> = self.stdout.flush().collect();
        for line in lines {
            self.stdout_line(line.text, line.result);
        }
        let lines: Vec<_> = self.stderr.flush().collect();
        for line in lines {
            self.append(LogEntry::error(line.text));
        }
        self.envelope
    }
}
