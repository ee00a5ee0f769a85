use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tsync::config::{AgentConfig, CONFIG_FILE};
use tsync::lock::InstanceGuard;
use tsync::sync::{AgentContext, Scheduler};

#[derive(Parser)]
#[command(name = "tsync")]
#[command(version)]
#[command(about = "Push closed data files and the schema log to a sync receiver")]
struct Cli {
    /// Config file
    #[arg(short, long, env = "TSYNC_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Run a single sync cycle and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "tsync=debug" } else { "tsync=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = AgentConfig::load(&cli.config);
    let guard = InstanceGuard::acquire(&config.lock_path())
        .context("Cannot start sync sender")?;
    tracing::debug!("Holding sender lock {}", guard.path().display());

    let ctx = Arc::new(AgentContext::new(config));
    let scheduler = Scheduler::new(ctx);

    if cli.once {
        scheduler.run_once().await?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    scheduler.run(shutdown_rx).await?;
    Ok(())
}
