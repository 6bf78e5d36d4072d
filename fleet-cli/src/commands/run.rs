//! Run command handler

use anyhow::{Context, Result};
use fleet_core::domain::operation::Operation;
use fleet_orchestrator::JobService;

use super::output::follow_job;
use crate::config::Config;

/// Submits one operation and follows it to the end
pub async fn handle_run(config: &Config, operation: &str, host: &str, params: &str) -> Result<()> {
    let operation: Operation = operation.parse()?;
    let parameters: serde_json::Value =
        serde_json::from_str(params).context("parameters must be valid JSON")?;

    let service = JobService::new(config.orchestrator()?, config.executor()?);
    follow_job(&service, |service| service.submit(operation, host, parameters)).await
}
