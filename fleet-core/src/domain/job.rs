//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::log::LogEntry;
use super::operation::Operation;

/// Opaque job identifier
pub type JobId = Uuid;

/// Job record
///
/// Lives only in the orchestrator's in-memory registry; it is never written to
/// disk and does not survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub operation: Operation,
    pub state: JobState,
    /// Immutable after creation; `None` for control-only parents
    pub target_host: Option<String>,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Append-only
    pub output: Vec<LogEntry>,
    pub error: Option<JobFailure>,
    /// Structured data returned by the agent (e.g. the created resource id)
    pub result: Option<serde_json::Value>,
    pub parent_id: Option<JobId>,
    pub children: Vec<JobId>,
}

impl Job {
    pub fn new(
        operation: Operation,
        target_host: Option<String>,
        parameters: serde_json::Value,
        parent_id: Option<JobId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            state: JobState::Pending,
            target_host,
            parameters,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output: Vec::new(),
            error: None,
            result: None,
            parent_id,
            children: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Terminal; some children completed and at least one did not
    Partial,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            JobState::Pending => matches!(
                next,
                JobState::Running | JobState::Cancelled | JobState::Failed | JobState::Partial
            ),
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "Pending"),
            JobState::Running => write!(f, "Running"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Failed => write!(f, "Failed"),
            JobState::Partial => write!(f, "Partial"),
            JobState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Category of a terminal error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    HostUnavailable,
    RemoteTimeout,
    RemoteProtocol,
    RemoteExecution,
    /// A child of a composite job did not complete
    ChildFailed,
    Cancelled,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::HostUnavailable => "host unavailable",
            FailureKind::RemoteTimeout => "remote timeout",
            FailureKind::RemoteProtocol => "remote protocol error",
            FailureKind::RemoteExecution => "remote execution error",
            FailureKind::ChildFailed => "child job failed",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Terminal error attached to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    /// Machine-readable code reported by the agent, kept verbatim
    pub code: Option<String>,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        for state in [
            JobState::Completed,
            JobState::Failed,
            JobState::Partial,
            JobState::Cancelled,
        ] {
            assert!(state.is_terminal());
        }
    }

    #[test]
    fn test_transitions_are_monotonic() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Pending.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
        assert!(!JobState::Pending.can_transition_to(JobState::Pending));
        assert!(JobState::Running.can_transition_to(JobState::Completed));
        assert!(!JobState::Running.can_transition_to(JobState::Pending));
        assert!(!JobState::Running.can_transition_to(JobState::Running));

        for terminal in [
            JobState::Completed,
            JobState::Failed,
            JobState::Partial,
            JobState::Cancelled,
        ] {
            assert!(!terminal.can_transition_to(JobState::Running));
            assert!(!terminal.can_transition_to(JobState::Pending));
            assert!(!terminal.can_transition_to(JobState::Failed));
        }
    }

    #[test]
    fn test_failure_display_keeps_agent_code() {
        let failure = JobFailure::new(FailureKind::RemoteExecution, "VM already exists")
            .with_code(Some("VM_EXISTS".to_string()));
        assert_eq!(
            failure.to_string(),
            "remote execution error [VM_EXISTS]: VM already exists"
        );
    }
}
