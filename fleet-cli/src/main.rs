//! Fleet CLI
//!
//! Runs infrastructure jobs against remote hosts from the command line. Each
//! invocation starts an in-process orchestrator, submits one job, streams its
//! output and exits with a non-zero status if the job did not complete.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Fleet infrastructure job CLI", long_about = None)]
struct Cli {
    /// Command template opening a remote session, e.g. `ssh {host} fleet-agent {operation}`
    #[arg(long, env = "FLEET_REMOTE_COMMAND")]
    remote_command: String,

    /// Command template checking a host is reachable, e.g. `ssh {host} true`
    #[arg(long, env = "FLEET_PROBE_COMMAND")]
    probe_command: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_cli=info,fleet_orchestrator=warn,fleet_runner=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = Config {
        remote_command: cli.remote_command,
        probe_command: cli.probe_command,
    };

    handle_command(cli.command, &config).await
}
