//! Configuration module
//!
//! Turns the CLI's remote command templates into an executor and loads the
//! orchestrator settings from the environment.

use anyhow::{Context, Result};
use fleet_runner::{ProcessExecutor, RemoteExecutor};
use std::sync::Arc;
use tracing::debug;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Template of the command that runs one operation on a host
    pub remote_command: String,
    /// Template of the connectivity check, if any
    pub probe_command: Option<String>,
}

impl Config {
    pub fn executor(&self) -> Result<Arc<dyn RemoteExecutor>> {
        let mut executor = ProcessExecutor::from_template(&self.remote_command)
            .context("remote command template is empty")?;
        debug!("Remote command template: {}", self.remote_command);
        if let Some(probe) = &self.probe_command {
            debug!("Probe command template: {}", probe);
            executor = executor.with_probe_template(probe);
        }
        Ok(Arc::new(executor))
    }

    /// Orchestrator settings; probing is only enabled with a probe command
    pub fn orchestrator(&self) -> Result<fleet_orchestrator::Config> {
        let config = fleet_orchestrator::Config::from_env()?
            .with_probe_hosts(self.probe_command.is_some());
        config.validate()?;
        debug!(
            "Orchestrator config: {} job workers, host slot wait {:?}",
            config.job_workers, config.host_slot_wait
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_template_is_rejected() {
        let config = Config {
            remote_command: "   ".to_string(),
            probe_command: None,
        };
        assert!(config.executor().is_err());

        let config = Config {
            remote_command: "ssh {host} fleet-agent".to_string(),
            probe_command: Some("ssh {host} true".to_string()),
        };
        assert!(config.executor().is_ok());
    }
}
