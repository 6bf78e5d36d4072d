//! End-to-end properties of the job service against a scripted executor

use fleet_core::domain::envelope::JobRequest;
use fleet_core::domain::job::{FailureKind, JobId, JobState};
use fleet_core::domain::log::LogLevel;
use fleet_core::domain::operation::Operation;
use fleet_core::dto::job::{CompositeStep, JobFilter};
use fleet_orchestrator::{ChannelObserver, Config, JobError, JobEvent, JobService};
use fleet_runner::{ExecutorError, OutputSink, RemoteCommand, RemoteExecutor, TaskCategory};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
enum Behaviour {
    Succeed(Duration),
    Fail { code: &'static str, message: &'static str },
    Hang,
    WrongCorrelation,
    NoEnvelope,
    /// Two success envelopes, then a non-zero exit
    Noisy,
}

#[derive(Default)]
struct Activity {
    active: HashMap<String, usize>,
    max_active: HashMap<String, usize>,
    started: Vec<(String, String)>,
}

/// Answers like a host agent, keyed by the resource name in the request
#[derive(Default)]
struct ScriptedExecutor {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    unreachable: Mutex<HashSet<String>>,
    activity: Mutex<Activity>,
}

impl ScriptedExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, name: &str, behaviour: Behaviour) {
        self.behaviours
            .lock()
            .unwrap()
            .insert(name.to_string(), behaviour);
    }

    fn cut_off(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }

    /// Resource names in the order their commands started on `host`
    fn started_on(&self, host: &str) -> Vec<String> {
        self.activity
            .lock()
            .unwrap()
            .started
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn max_active(&self, host: &str) -> usize {
        self.activity
            .lock()
            .unwrap()
            .max_active
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, host: &str, name: &str) {
        let mut activity = self.activity.lock().unwrap();
        let active = activity.active.entry(host.to_string()).or_default();
        *active += 1;
        let now = *active;
        let max = activity.max_active.entry(host.to_string()).or_default();
        *max = (*max).max(now);
        activity.started.push((host.to_string(), name.to_string()));
    }

    fn leave(&self, host: &str) {
        let mut activity = self.activity.lock().unwrap();
        if let Some(active) = activity.active.get_mut(host) {
            *active -= 1;
        }
    }
}

fn envelope(status: &str, correlation_id: &str) -> String {
    format!(
        "{}\n",
        json!({
            "status": status,
            "message": "done",
            "data": {"ok": true},
            "logs": ["agent finished"],
            "correlation_id": correlation_id,
        })
    )
}

impl RemoteExecutor for ScriptedExecutor {
    fn execute(&self, command: &RemoteCommand, sink: &OutputSink) -> Result<i32, ExecutorError> {
        let request: JobRequest = serde_json::from_str(&command.payload)
            .map_err(|e| ExecutorError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        let name = request.resource_spec["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or(Behaviour::Succeed(Duration::from_millis(20)));

        self.enter(&command.host, &name);
        sink.stdout(format!("Running {} for {}\n", command.operation, name).as_bytes());

        let exit = match behaviour {
            Behaviour::Succeed(delay) => {
                std::thread::sleep(delay);
                sink.stdout(envelope("success", &request.correlation_id).as_bytes());
                0
            }
            Behaviour::Fail { code, message } => {
                sink.stderr(b"something went wrong\n");
                let line = json!({
                    "status": "error",
                    "code": code,
                    "message": message,
                    "correlation_id": request.correlation_id,
                });
                sink.stdout(format!("{}\n", line).as_bytes());
                1
            }
            Behaviour::Hang => {
                while !sink.is_discarded() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                1
            }
            Behaviour::WrongCorrelation => {
                sink.stdout(envelope("success", "someone-else").as_bytes());
                0
            }
            Behaviour::NoEnvelope => 0,
            Behaviour::Noisy => {
                sink.stdout(envelope("error", &request.correlation_id).as_bytes());
                sink.stdout(envelope("success", &request.correlation_id).as_bytes());
                3
            }
        };

        self.leave(&command.host);
        Ok(exit)
    }

    fn probe(&self, host: &str) -> Result<(), ExecutorError> {
        if self.unreachable.lock().unwrap().contains(host) {
            return Err(ExecutorError::Unreachable {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

fn config(workers: usize) -> Config {
    Config::default()
        .with_job_workers(workers)
        .with_probe_hosts(false)
        .with_job_timeout(Duration::from_secs(5))
}

fn vm(name: &str) -> serde_json::Value {
    json!({"name": name, "cpu_count": 2, "memory_mb": 2048})
}

async fn wait_all(service: &JobService, ids: &[JobId]) {
    for id in ids {
        tokio::time::timeout(Duration::from_secs(10), service.wait(*id))
            .await
            .expect("job did not finish in time")
            .unwrap();
    }
}

async fn wait_started(executor: &ScriptedExecutor, host: &str, name: &str) {
    for _ in 0..400 {
        if executor.started_on(host).iter().any(|started| started == name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never started on {}", name, host);
}

#[tokio::test]
async fn test_one_job_per_host_in_submission_order() {
    let executor = ScriptedExecutor::new();
    let service = JobService::new(config(4), executor.clone());

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            service
                .submit(Operation::CreateVm, "hv-01", vm(&format!("web-{}", i)))
                .unwrap(),
        );
    }
    ids.push(service.submit(Operation::CreateVm, "hv-02", vm("db-0")).unwrap());
    service.start();
    wait_all(&service, &ids).await;

    for id in &ids {
        assert_eq!(service.get(*id).unwrap().state, JobState::Completed);
    }
    assert_eq!(executor.max_active("hv-01"), 1);
    assert_eq!(
        executor.started_on("hv-01"),
        vec!["web-0", "web-1", "web-2", "web-3"]
    );
    assert_eq!(executor.started_on("hv-02"), vec!["db-0"]);

    let job = service.get(ids[0]).unwrap();
    assert!(job.output.iter().any(|entry| entry.message == "Running create_vm for web-0"));
    assert!(job.output.iter().any(|entry| entry.message == "agent finished"));
    assert_eq!(job.result, Some(json!({"ok": true})));

    service.shutdown().await;
}

#[tokio::test]
async fn test_busy_host_is_granted_in_arrival_order() {
    let executor = ScriptedExecutor::new();
    let service = JobService::new(config(3), executor.clone());

    let blocker = service
        .host_slots()
        .try_acquire("hv-01", uuid::Uuid::new_v4())
        .unwrap();

    let ids: Vec<JobId> = ["j1", "j2", "j3"]
        .iter()
        .map(|name| service.submit(Operation::CreateVm, "hv-01", vm(name)).unwrap())
        .collect();
    service.start();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(executor.started_on("hv-01").is_empty());
    assert_eq!(service.host_slots().queue_depth("hv-01"), 3);

    drop(blocker);
    wait_all(&service, &ids).await;
    assert_eq!(executor.started_on("hv-01"), vec!["j1", "j2", "j3"]);

    service.shutdown().await;
}

#[tokio::test]
async fn test_busy_host_does_not_delay_other_hosts() {
    let executor = ScriptedExecutor::new();
    for name in ["web-0", "web-1", "web-2"] {
        executor.script(name, Behaviour::Succeed(Duration::from_millis(400)));
    }
    // More jobs queue on hv-01 than there are worker loops
    let service = JobService::new(config(2), executor.clone());

    let mut ids: Vec<JobId> = ["web-0", "web-1", "web-2"]
        .iter()
        .map(|name| service.submit(Operation::CreateVm, "hv-01", vm(name)).unwrap())
        .collect();
    ids.push(service.submit(Operation::CreateVm, "hv-02", vm("db")).unwrap());
    service.start();

    tokio::time::timeout(
        Duration::from_millis(300),
        wait_started(&executor, "hv-02", "db"),
    )
    .await
    .expect("hv-02 waited behind hv-01");
    assert_eq!(executor.started_on("hv-01"), vec!["web-0"]);

    wait_all(&service, &ids).await;
    assert_eq!(executor.started_on("hv-01"), vec!["web-0", "web-1", "web-2"]);
    assert_eq!(executor.max_active("hv-01"), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_while_waiting_for_host() {
    let executor = ScriptedExecutor::new();
    let service = JobService::new(config(3), executor.clone());

    let blocker = service
        .host_slots()
        .try_acquire("hv-01", uuid::Uuid::new_v4())
        .unwrap();
    let ids: Vec<JobId> = ["j1", "j2", "j3"]
        .iter()
        .map(|name| service.submit(Operation::CreateVm, "hv-01", vm(name)).unwrap())
        .collect();
    service.start();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.host_slots().queue_depth("hv-01"), 3);

    service.cancel(ids[1]).unwrap();
    let job = tokio::time::timeout(Duration::from_secs(1), service.wait(ids[1]))
        .await
        .expect("cancelled waiter did not finish")
        .unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.error.unwrap().kind, FailureKind::Cancelled);
    assert_eq!(service.host_slots().queue_depth("hv-01"), 2);

    drop(blocker);
    wait_all(&service, &[ids[0], ids[2]]).await;
    assert_eq!(executor.started_on("hv-01"), vec!["j1", "j3"]);

    service.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_call_keeps_the_host_until_it_returns() {
    let executor = ScriptedExecutor::new();
    executor.script("slow", Behaviour::Succeed(Duration::from_millis(400)));
    let service = JobService::new(config(2), executor.clone());

    let slow = service.submit(Operation::CreateVm, "hv-01", vm("slow")).unwrap();
    let next = service.submit(Operation::CreateVm, "hv-01", vm("next")).unwrap();
    service.start();
    wait_started(&executor, "hv-01", "slow").await;

    service.cancel(slow).unwrap();
    wait_all(&service, &[slow]).await;
    assert_eq!(service.get(slow).unwrap().state, JobState::Cancelled);
    assert_eq!(service.host_slots().holder("hv-01"), Some(slow));
    assert_eq!(executor.started_on("hv-01"), vec!["slow"]);

    wait_all(&service, &[next]).await;
    assert_eq!(service.get(next).unwrap().state, JobState::Completed);
    assert_eq!(executor.max_active("hv-01"), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_call_keeps_the_host_until_it_returns() {
    let executor = ScriptedExecutor::new();
    executor.script("slow", Behaviour::Succeed(Duration::from_millis(400)));
    let service = JobService::new(
        config(2).with_job_timeout(Duration::from_millis(150)),
        executor.clone(),
    );

    let slow = service.submit(Operation::CreateVm, "hv-01", vm("slow")).unwrap();
    let next = service.submit(Operation::CreateVm, "hv-01", vm("next")).unwrap();
    service.start();
    wait_all(&service, &[slow, next]).await;

    let job = service.get(slow).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().kind, FailureKind::RemoteTimeout);
    assert_eq!(service.get(next).unwrap().state, JobState::Completed);
    assert_eq!(executor.started_on("hv-01"), vec!["slow", "next"]);
    assert_eq!(executor.max_active("hv-01"), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_release_grace_bounds_the_hold() {
    let executor = ScriptedExecutor::new();
    executor.script("slow", Behaviour::Succeed(Duration::from_secs(2)));
    let service = JobService::new(
        config(2).with_release_grace(Duration::from_millis(100)),
        executor.clone(),
    );

    let slow = service.submit(Operation::CreateVm, "hv-01", vm("slow")).unwrap();
    let next = service.submit(Operation::CreateVm, "hv-01", vm("next")).unwrap();
    service.start();
    wait_started(&executor, "hv-01", "slow").await;

    service.cancel(slow).unwrap();
    let job = tokio::time::timeout(Duration::from_secs(1), service.wait(next))
        .await
        .expect("host was held past its grace period")
        .unwrap();
    assert_eq!(job.state, JobState::Completed);

    service.shutdown().await;
}

#[tokio::test]
async fn test_composite_stops_after_failed_step() {
    let executor = ScriptedExecutor::new();
    executor.script(
        "data",
        Behaviour::Fail {
            code: "DISK_EXISTS",
            message: "disk data already exists",
        },
    );
    let service = JobService::new(config(2), executor.clone());

    let parent = service
        .submit_composite(vec![
            CompositeStep::new(Operation::CreateVm, "hv-01", vm("web")),
            CompositeStep::new(
                Operation::CreateDisk,
                "hv-01",
                json!({"vm_name": "web", "name": "data", "size_gb": 20}),
            ),
            CompositeStep::new(
                Operation::CreateNic,
                "hv-01",
                json!({"vm_name": "web", "name": "eth0", "switch_name": "lan"}),
            ),
        ])
        .unwrap();
    service.start();
    wait_all(&service, &[parent]).await;

    let job = service.get(parent).unwrap();
    assert_eq!(job.state, JobState::Partial);
    assert_eq!(job.error.as_ref().unwrap().kind, FailureKind::ChildFailed);

    let states: Vec<JobState> = job
        .children
        .iter()
        .map(|child| service.get(*child).unwrap().state)
        .collect();
    assert_eq!(
        states,
        vec![JobState::Completed, JobState::Failed, JobState::Cancelled]
    );

    let failed = service.get(job.children[1]).unwrap();
    let error = failed.error.unwrap();
    assert_eq!(error.kind, FailureKind::RemoteExecution);
    assert_eq!(error.code.as_deref(), Some("DISK_EXISTS"));
    assert_eq!(error.message, "disk data already exists");
    assert!(failed.output.iter().any(|entry| entry.message == "something went wrong"));

    assert_eq!(executor.started_on("hv-01"), vec!["web", "data"]);

    service.shutdown().await;
}

#[tokio::test]
async fn test_managed_deployment_expands_into_steps() {
    let executor = ScriptedExecutor::new();
    let service = JobService::new(config(2), executor.clone());

    let parent = service
        .submit(
            Operation::ManagedDeployment,
            "hv-01",
            json!({
                "vm": vm("app"),
                "disks": [{"name": "os", "size_gb": 40}],
                "nics": [{"name": "eth0", "switch_name": "lan"}],
            }),
        )
        .unwrap();
    service.start();
    wait_all(&service, &[parent]).await;

    let job = service.get(parent).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.children.len(), 3);
    assert_eq!(executor.started_on("hv-01"), vec!["app", "os", "eth0"]);

    service.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_job_releases_the_host() {
    let executor = ScriptedExecutor::new();
    executor.script("stuck", Behaviour::Hang);
    let service = JobService::new(
        config(2).with_job_timeout(Duration::from_millis(150)),
        executor.clone(),
    );

    let stuck = service.submit(Operation::CreateVm, "hv-01", vm("stuck")).unwrap();
    let next = service.submit(Operation::CreateVm, "hv-01", vm("next")).unwrap();
    service.start();
    wait_all(&service, &[stuck, next]).await;

    let job = service.get(stuck).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().kind, FailureKind::RemoteTimeout);
    assert_eq!(service.get(next).unwrap().state, JobState::Completed);

    let metrics = service.metrics();
    let job_pool = metrics
        .tasks
        .pools
        .iter()
        .find(|pool| pool.category == TaskCategory::Job)
        .unwrap();
    assert!(job_pool.scaling.replaced >= 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_protocol_errors_fail_the_job() {
    let executor = ScriptedExecutor::new();
    executor.script("spoofed", Behaviour::WrongCorrelation);
    executor.script("silent", Behaviour::NoEnvelope);
    let service = JobService::new(config(2), executor.clone());

    let spoofed = service.submit(Operation::CreateVm, "hv-01", vm("spoofed")).unwrap();
    let silent = service.submit(Operation::CreateVm, "hv-02", vm("silent")).unwrap();
    service.start();
    wait_all(&service, &[spoofed, silent]).await;

    for id in [spoofed, silent] {
        let job = service.get(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.unwrap().kind, FailureKind::RemoteProtocol);
    }
    // A mismatched reply carries no trusted data
    assert_eq!(service.get(spoofed).unwrap().result, None);

    service.shutdown().await;
}

#[tokio::test]
async fn test_last_envelope_decides_and_anomalies_are_logged() {
    let executor = ScriptedExecutor::new();
    executor.script("noisy", Behaviour::Noisy);
    let service = JobService::new(config(1), executor);

    let id = service.submit(Operation::CreateVm, "hv-01", vm("noisy")).unwrap();
    service.start();
    wait_all(&service, &[id]).await;

    let job = service.get(id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    let warnings: Vec<&str> = job
        .output
        .iter()
        .filter(|entry| entry.level == LogLevel::Warning)
        .map(|entry| entry.message.as_str())
        .collect();
    assert_eq!(
        warnings,
        vec![
            "duplicate result envelope, keeping the last",
            "remote command exited with 3 after reporting success",
        ]
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_host_fails_before_dispatch() {
    let executor = ScriptedExecutor::new();
    executor.cut_off("hv-09");
    let service = JobService::new(config(1).with_probe_hosts(true), executor.clone());

    let id = service.submit(Operation::CreateVm, "hv-09", vm("web")).unwrap();
    service.start();
    wait_all(&service, &[id]).await;

    let job = service.get(id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().kind, FailureKind::HostUnavailable);
    assert!(executor.started_on("hv-09").is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn test_invalid_submissions_create_no_job() {
    let service = JobService::new(config(1), ScriptedExecutor::new());

    let err = service
        .submit(Operation::CreateVm, "hv-01", json!({"name": "web"}))
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
    assert!(matches!(
        service.submit(Operation::CreateVm, "", vm("web")),
        Err(JobError::Validation(_))
    ));
    assert!(matches!(
        service.submit_composite(Vec::new()),
        Err(JobError::Validation(_))
    ));
    assert!(service.list(&JobFilter::default()).is_empty());
}

#[tokio::test]
async fn test_active_resource_cannot_be_claimed_twice() {
    let service = JobService::new(config(1), ScriptedExecutor::new());

    let first = service.submit(Operation::CreateVm, "hv-01", vm("web")).unwrap();
    let err = service
        .submit(Operation::CreateVm, "HV-01", vm("WEB"))
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
    // Another host is a different resource
    assert!(service.submit(Operation::CreateVm, "hv-02", vm("web")).is_ok());

    service.start();
    wait_all(&service, &[first]).await;
    assert!(service.submit(Operation::CreateVm, "hv-01", vm("web")).is_ok());

    service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_pending_and_running_jobs() {
    let executor = ScriptedExecutor::new();
    executor.script("stuck", Behaviour::Hang);
    let service = JobService::new(config(2), executor.clone());

    let queued = service.submit(Operation::CreateVm, "hv-01", vm("queued")).unwrap();
    service.cancel(queued).unwrap();
    assert_eq!(service.get(queued).unwrap().state, JobState::Cancelled);
    // Cancelling a finished job changes nothing
    service.cancel(queued).unwrap();

    let stuck = service.submit(Operation::CreateVm, "hv-01", vm("stuck")).unwrap();
    let waiting = service.submit(Operation::CreateVm, "hv-01", vm("waiting")).unwrap();
    service.start();
    wait_started(&executor, "hv-01", "stuck").await;

    service.cancel(stuck).unwrap();
    wait_all(&service, &[stuck, waiting]).await;

    let job = service.get(stuck).unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.error.unwrap().kind, FailureKind::Cancelled);
    assert_eq!(service.get(waiting).unwrap().state, JobState::Completed);
    assert!(!executor.started_on("hv-01").contains(&"queued".to_string()));

    assert!(matches!(
        service.cancel(uuid::Uuid::new_v4()),
        Err(JobError::NotFound(_))
    ));

    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_outstanding_jobs() {
    let executor = ScriptedExecutor::new();
    executor.script("stuck", Behaviour::Hang);
    let service = JobService::new(config(1), executor.clone());

    let stuck = service.submit(Operation::CreateVm, "hv-01", vm("stuck")).unwrap();
    let queued = service.submit(Operation::CreateVm, "hv-01", vm("queued")).unwrap();
    service.start();
    wait_started(&executor, "hv-01", "stuck").await;

    tokio::time::timeout(Duration::from_secs(5), service.shutdown())
        .await
        .expect("shutdown hung");

    assert_eq!(service.get(stuck).unwrap().state, JobState::Cancelled);
    assert_eq!(service.get(queued).unwrap().state, JobState::Cancelled);
    assert!(matches!(
        service.submit(Operation::CreateVm, "hv-01", vm("late")),
        Err(JobError::Shutdown)
    ));
}

#[tokio::test]
async fn test_observers_and_metrics() {
    let executor = ScriptedExecutor::new();
    let service = JobService::new(config(1), executor);
    let observer = Arc::new(ChannelObserver::new(64));
    let mut events = observer.subscribe();
    service.subscribe(observer);

    let id = service.submit(Operation::CreateVm, "hv-01", vm("web")).unwrap();
    assert_eq!(service.metrics().queue_depth, 1);
    assert_eq!(service.metrics().jobs.pending, 1);

    service.start();
    wait_all(&service, &[id]).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id(), id);
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(JobEvent::Created { .. })));
    assert!(seen.iter().any(|event| matches!(
        event,
        JobEvent::Transitioned { to: JobState::Running, .. }
    )));
    assert!(seen.iter().any(|event| matches!(event, JobEvent::Output { .. })));
    assert!(matches!(
        seen.last(),
        Some(JobEvent::Transitioned { to: JobState::Completed, .. })
    ));

    let metrics = service.metrics();
    assert_eq!(metrics.queue_depth, 0);
    assert_eq!(metrics.jobs.completed, 1);
    assert_eq!(metrics.hosts.len(), 1);
    assert_eq!(metrics.hosts[0].holder, None);
    let json = serde_json::to_value(&metrics).unwrap();
    assert_eq!(json["jobs"]["completed"], 1);

    service.shutdown().await;
}
