//! test-agent - runs test packages on behalf of a test agency.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use testagency::agent::{AgentOptions, RemoteTestAgent};
use testagency::config;

#[derive(Parser)]
#[command(name = "test-agent")]
#[command(about = "Test agent process launched by the test agency", long_about = None)]
#[command(version)]
struct Cli {
    /// Id assigned by the agency
    agent_id: Uuid,

    /// Agency callback address (tcp://host:port)
    agency_url: String,

    /// Wait for Enter before connecting
    #[arg(long)]
    pause: bool,

    /// Verbose output
    #[arg(long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "testagency.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = config::load_config_or_default(&cli.config)?;
    let options = AgentOptions {
        agent_id: cli.agent_id,
        agency_url: cli.agency_url,
        pause: cli.pause,
        verbose: cli.verbose,
    };

    let mut agent = RemoteTestAgent::new(options, config).context("Failed to set up the agent")?;
    agent.run().await.context("Agent failed")?;
    Ok(())
}
