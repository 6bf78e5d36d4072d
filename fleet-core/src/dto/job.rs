//! Job DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::{Job, JobFailure, JobId, JobState};
use crate::domain::log::LogEntry;
use crate::domain::operation::Operation;
use crate::domain::resource::ResourceSpec;

/// Snapshot of a job handed to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub operation: Operation,
    pub state: JobState,
    pub target_host: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Vec<LogEntry>,
    pub error: Option<JobFailure>,
    pub result: Option<serde_json::Value>,
    pub parent_id: Option<JobId>,
    pub children: Vec<JobId>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            operation: job.operation,
            state: job.state,
            target_host: job.target_host,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            output: job.output,
            error: job.error,
            result: job.result,
            parent_id: job.parent_id,
            children: job.children,
        }
    }
}

/// Lightweight job summary for listings (no output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub operation: Operation,
    pub state: JobState,
    pub target_host: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub parent_id: Option<JobId>,
    pub output_lines: usize,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            operation: job.operation,
            state: job.state,
            target_host: job.target_host.clone(),
            created_at: job.created_at,
            finished_at: job.finished_at,
            parent_id: job.parent_id,
            output_lines: job.output.len(),
        }
    }
}

/// One step of a composite submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeStep {
    pub operation: Operation,
    pub target_host: Option<String>,
    pub parameters: serde_json::Value,
}

impl CompositeStep {
    pub fn new(
        operation: Operation,
        target_host: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            operation,
            target_host: Some(target_host.into()),
            parameters,
        }
    }

    /// Builds a step from an already typed spec
    pub fn from_spec(target_host: impl Into<String>, spec: &ResourceSpec) -> Self {
        Self::new(spec.operation(), target_host, spec.to_parameters())
    }
}

/// Criteria for listing jobs; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub target_host: Option<String>,
    pub parent_id: Option<JobId>,
    /// Only jobs without a parent
    #[serde(default)]
    pub top_level_only: bool,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(state) = self.state {
            if job.state != state {
                return false;
            }
        }
        if let Some(host) = &self.target_host {
            if job.target_host.as_deref() != Some(host.as_str()) {
                return false;
            }
        }
        if let Some(parent) = self.parent_id {
            if job.parent_id != Some(parent) {
                return false;
            }
        }
        !(self.top_level_only && job.parent_id.is_some())
    }
}
