//! Administrative CLI for the Flotilla agent-pool orchestrator.
//!
//! Builds an in-process orchestrator from a TOML config and runs one
//! administrative command against it: `spawn`, `list`, `health`, or
//! `rebalance`. Exit code 0 on success, non-zero on any registry or
//! config error.

use anyhow::Context;
use clap::{Parser, Subcommand};
use flotilla_core::config::OrchestratorConfig;
use flotilla_orchestrator::{AgentHost, HealthProbe, NoopHost, Orchestrator, StaticProbe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flotilla", about = "Flotilla — agent pool orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flotilla.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn one agent into a pool
    Spawn {
        /// Pool to grow
        #[arg(long)]
        pool: String,
    },
    /// List pools and their occupancy
    List {
        /// Include every agent record
        #[arg(long)]
        verbose: bool,
    },
    /// Run one health probe round and report the results
    Health,
    /// Re-run task assignment over all queued tasks
    Rebalance,
}

fn load_config(path: &PathBuf) -> anyhow::Result<OrchestratorConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    let config: OrchestratorConfig =
        toml::from_str(&raw).with_context(|| format!("invalid config '{}'", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let host: Arc<dyn AgentHost> = Arc::new(NoopHost);
    let probe: Arc<dyn HealthProbe> = Arc::new(StaticProbe::new(true));
    let orchestrator = Orchestrator::new(config, host, probe).await?;

    match cli.command {
        Commands::Spawn { pool } => {
            let agent_id = orchestrator.spawn_agent(&pool).await?;
            info!(agent = %agent_id, pool = %pool, "agent spawned");
            println!("{agent_id}");
        }
        Commands::List { verbose } => {
            let snapshots = orchestrator.pool_snapshots().await;
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
            if verbose {
                let agents = orchestrator.agent_snapshots().await;
                println!("{}", serde_json::to_string_pretty(&agents)?);
            }
        }
        Commands::Health => {
            let results = orchestrator.probe_round().await;
            println!("{}", serde_json::to_string_pretty(&results)?);
            let failures = results.iter().filter(|r| !r.success).count();
            info!(
                probed = results.len(),
                failures, "health probe round complete"
            );
        }
        Commands::Rebalance => {
            let assigned = orchestrator.rebalance().await;
            info!(assigned, "rebalance complete");
            println!("{assigned}");
        }
    }

    Ok(())
}
