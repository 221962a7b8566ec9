use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pricewatch_engine::{Engine, EngineConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Product price monitoring engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the scheduler daemon and run until ctrl-c.
    Run,
    /// Run one fixed-interval tick and one on-change tick, then exit.
    Tick,
    /// Run the inactivity sweep once.
    Sweep,
    /// Re-fetch tracked products and remap changed identifiers.
    RefreshIds,
    /// Print one subscriber's tracking stats as JSON.
    Stats { subscriber: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let engine = Arc::new(Engine::from_config(EngineConfig::from_env()).await?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            engine.run_until_shutdown().await?;
        }
        Commands::Tick => {
            let now = Utc::now();
            let fixed = engine.run_fixed_tick(now).await;
            println!(
                "fixed tick: run_id={} examined={} checked={} notified={} failed={}",
                fixed.run_id, fixed.examined, fixed.checked, fixed.notified, fixed.failed
            );
            let on_change = engine.run_on_change_tick(now).await;
            println!(
                "on-change tick: run_id={} examined={} checked={} notified={} failed={}",
                on_change.run_id,
                on_change.examined,
                on_change.checked,
                on_change.notified,
                on_change.failed
            );
        }
        Commands::Sweep => {
            let removed = engine.run_inactivity_sweep(Utc::now()).await;
            println!("sweep complete: removed={}", removed.len());
        }
        Commands::RefreshIds => {
            let summary = engine.run_identity_refresh().await;
            println!(
                "identity refresh: run_id={} subscribers={} remapped={}",
                summary.run_id, summary.subscribers, summary.remapped
            );
        }
        Commands::Stats { subscriber } => {
            let stats = engine.stats(&subscriber).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
