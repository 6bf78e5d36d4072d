//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod deploy;
mod output;
mod probe;
mod run;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a single operation on a host
    Run {
        /// Operation name, e.g. create_vm
        operation: String,
        /// Target host
        host: String,
        /// Operation parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },
    /// Run a managed deployment described in a JSON file
    Deploy {
        /// Path to the deployment file
        file: PathBuf,
        /// Target host
        #[arg(long)]
        host: String,
    },
    /// Check that a host is reachable
    Probe {
        /// Target host
        host: String,
    },
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Run {
            operation,
            host,
            params,
        } => run::handle_run(config, &operation, &host, &params).await,
        Commands::Deploy { file, host } => deploy::handle_deploy(config, &file, &host).await,
        Commands::Probe { host } => probe::handle_probe(config, &host).await,
    }
}
