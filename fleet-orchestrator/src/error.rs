//! Job service errors

use fleet_core::domain::job::{FailureKind, JobFailure, JobId};
use std::time::Duration;

use crate::registry::RegistryError;

/// Errors surfaced by the job service
///
/// The remote variants double as the terminal error recorded on a failed job;
/// see [`JobError::to_failure`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    /// Rejected at the gate; no job was created
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("host {host} is unavailable: {reason}")]
    HostUnavailable { host: String, reason: String },

    #[error("remote call timed out after {0:?}")]
    RemoteTimeout(Duration),

    /// The agent answered with something that is not a valid reply to the request
    #[error("remote protocol error: {0}")]
    RemoteProtocol(String),

    /// The agent ran the operation and reported a failure
    #[error("remote execution failed{}: {message}", code_suffix(.code))]
    RemoteExecution {
        code: Option<String>,
        message: String,
    },

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job was cancelled: {0}")]
    Cancelled(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("job service is shut down")]
    Shutdown,
}

impl JobError {
    pub fn remote_execution(code: Option<String>, message: impl Into<String>) -> Self {
        JobError::RemoteExecution {
            code,
            message: message.into(),
        }
    }

    /// Terminal error to record on the job this error ended
    pub fn to_failure(&self) -> JobFailure {
        match self {
            JobError::HostUnavailable { .. } => {
                JobFailure::new(FailureKind::HostUnavailable, self.to_string())
            }
            JobError::RemoteTimeout(_) => JobFailure::new(FailureKind::RemoteTimeout, self.to_string()),
            JobError::RemoteProtocol(message) => {
                JobFailure::new(FailureKind::RemoteProtocol, message.clone())
            }
            JobError::RemoteExecution { code, message } => {
                JobFailure::new(FailureKind::RemoteExecution, message.clone()).with_code(code.clone())
            }
            JobError::Cancelled(reason) => JobFailure::new(FailureKind::Cancelled, reason.clone()),
            JobError::Shutdown => JobFailure::new(FailureKind::Cancelled, self.to_string()),
            _ => JobFailure::new(FailureKind::Internal, self.to_string()),
        }
    }
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" [{}]", c)).unwrap_or_default()
}

impl From<RegistryError> for JobError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => JobError::NotFound(id),
            RegistryError::ResourceBusy { .. } => JobError::Validation(err.to_string()),
            other => JobError::InvariantViolation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::domain::job::JobState;
    use uuid::Uuid;

    #[test]
    fn test_remote_execution_keeps_agent_code() {
        let err = JobError::remote_execution(Some("DISK_FULL".to_string()), "no space on volume");
        assert_eq!(err.to_string(), "remote execution failed [DISK_FULL]: no space on volume");

        let failure = err.to_failure();
        assert_eq!(failure.kind, FailureKind::RemoteExecution);
        assert_eq!(failure.code.as_deref(), Some("DISK_FULL"));
        assert_eq!(failure.message, "no space on volume");

        let bare = JobError::remote_execution(None, "boom");
        assert_eq!(bare.to_string(), "remote execution failed: boom");
    }

    #[test]
    fn test_registry_errors_map_to_taxonomy() {
        let id = Uuid::new_v4();
        assert_eq!(JobError::from(RegistryError::NotFound(id)), JobError::NotFound(id));

        let illegal = RegistryError::IllegalTransition {
            id,
            from: JobState::Completed,
            to: JobState::Running,
        };
        assert!(matches!(JobError::from(illegal), JobError::InvariantViolation(_)));

        let busy = RegistryError::ResourceBusy {
            resource: "vm 'web'".to_string(),
            host: "hv-01".to_string(),
            holder: id,
        };
        assert!(matches!(JobError::from(busy), JobError::Validation(_)));
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            JobError::RemoteTimeout(Duration::from_secs(5)).to_failure().kind,
            FailureKind::RemoteTimeout
        );
        assert_eq!(
            JobError::RemoteProtocol("bad".to_string()).to_failure().kind,
            FailureKind::RemoteProtocol
        );
        assert_eq!(JobError::Shutdown.to_failure().kind, FailureKind::Cancelled);
        assert_eq!(
            JobError::Internal("panic".to_string()).to_failure().kind,
            FailureKind::Internal
        );
    }
}
