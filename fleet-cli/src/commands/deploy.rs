//! Deploy command handler
//!
//! Reads a managed deployment (machine, disks, adapters, guest settings) from
//! a JSON file and runs it as one composite job.

use anyhow::{Context, Result};
use colored::*;
use fleet_core::domain::operation::Operation;
use fleet_orchestrator::JobService;
use std::path::Path;

use super::output::follow_job;
use crate::config::Config;

pub async fn handle_deploy(config: &Config, file: &Path, host: &str) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let deployment: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    println!(
        "{}",
        format!("Deploying {} to {}", file.display(), host).bold()
    );

    let service = JobService::new(config.orchestrator()?, config.executor()?);
    follow_job(&service, |service| {
        service.submit(Operation::ManagedDeployment, host, deployment)
    })
    .await
}
