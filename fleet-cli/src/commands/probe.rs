//! Probe command handler

use anyhow::{Result, bail};
use colored::*;
use fleet_runner::{RemoteTaskService, TaskCategory};

use crate::config::Config;

/// Runs the connectivity probe on the fast pool
pub async fn handle_probe(config: &Config, host: &str) -> Result<()> {
    if config.probe_command.is_none() {
        bail!("no probe command configured (--probe-command or FLEET_PROBE_COMMAND)");
    }

    let executor = config.executor()?;
    let tasks = RemoteTaskService::new(config.orchestrator()?.tasks);
    let target = host.to_string();
    let outcome = tasks
        .run(TaskCategory::Fast, None, move |_| executor.probe(&target))
        .await;
    tasks.shutdown();

    match outcome {
        Ok(Ok(())) => {
            println!("{} {} is reachable", "✓".green(), host.bold());
            Ok(())
        }
        Ok(Err(e)) => {
            println!("{} {}", "✗".red(), e.to_string().red());
            bail!("host {} is unreachable", host)
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e.to_string().red());
            bail!("probe of {} did not complete", host)
        }
    }
}
