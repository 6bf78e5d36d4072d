//! Wire envelopes exchanged with the remote host agent
//!
//! A request is serialized as one JSON document and handed to the remote
//! command. The agent answers on standard output with free-form log lines and
//! exactly one JSON result envelope echoing the request's correlation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::job::JobId;
use super::operation::Operation;

/// Request sent to a host agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub operation: Operation,
    pub resource_spec: JsonValue,
    pub correlation_id: String,
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub target_host: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub dispatched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<JobId>,
}

impl JobRequest {
    /// Serializes the request into the single-line payload the agent reads
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome reported by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
    Partial,
}

/// Final machine-readable answer of the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultEnvelope {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Why an envelope cannot be matched to its request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("result envelope carries no correlation id (expected {expected})")]
    Missing { expected: String },

    #[error("result envelope correlation id {actual} does not match request {expected}")]
    Mismatch { expected: String, actual: String },
}

impl JobResultEnvelope {
    /// Parses a single output line as a result envelope
    ///
    /// Only lines that look like a JSON object and carry a `status` field
    /// qualify; anything else is an ordinary log line.
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Checks that this envelope answers the request with `expected` id
    pub fn verify_correlation(&self, expected: &str) -> Result<(), CorrelationError> {
        match self.correlation_id.as_deref() {
            None | Some("") => Err(CorrelationError::Missing {
                expected: expected.to_string(),
            }),
            Some(actual) if actual != expected => Err(CorrelationError::Mismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }
}
