use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use sidetree_peer::{
    cas::MemCas,
    config::{Cli, Command, Config},
    document::MergePatchBuilder,
    ledger::MemLedger,
    lifecycle::{LifecycleManager, ManagerOptions},
    seed,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_peer(cli.config).await,
        Command::CheckSeed => check_seed(&cli.config),
    }
}

fn check_seed(config: &Config) -> Result<()> {
    let Some(path) = config.seed.as_deref() else {
        anyhow::bail!("check-seed requires --seed <PATH>");
    };
    let seed = seed::load(path)?;
    let report = seed::check(&seed);
    for line in report.lines.iter() {
        println!("{line}");
    }
    for err in report.errors.iter() {
        eprintln!("error: {err}");
    }
    if !report.is_ok() {
        anyhow::bail!("{} invalid record(s) in {}", report.errors.len(), path.display());
    }
    Ok(())
}

async fn run_peer(config: Config) -> Result<()> {
    let ledger = Arc::new(MemLedger::new());
    if let Some(path) = config.seed.as_deref() {
        let seed = seed::load(path)?;
        seed::apply(&seed, &ledger, &config.config_chaincode)?;
    }
    for channel_id in config.channels.iter() {
        if ledger.get_channel(channel_id).is_none() {
            ledger.create_channel(channel_id);
        }
    }

    let manager = LifecycleManager::new(
        ManagerOptions::from_config(&config),
        ledger.clone(),
        Arc::new(MemCas::new()),
        Arc::new(MergePatchBuilder),
    );

    info!(
        listen = %config.listen,
        msp_id = %config.msp_id,
        peer_id = %config.peer_id,
        channels = ?config.channels,
        "starting sidetree-peer"
    );
    for channel_id in config.channels.iter() {
        manager.channel_joined(channel_id).await?;
    }

    shutdown_signal().await;
    info!("shutting down");
    manager.close().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
