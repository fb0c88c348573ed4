use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sidetree-peer",
    about = "Ledger-configured document namespace services",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Join the configured channels and serve namespaces until interrupted (default).
    Run,

    /// Decode the records of a ledger seed file and report problems.
    CheckSeed,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "STP_LISTEN",
        value_name = "ADDR",
        default_value = "127.0.0.1:48326"
    )]
    pub listen: SocketAddr,

    #[arg(
        long = "msp-id",
        global = true,
        env = "STP_MSP_ID",
        value_name = "MSP",
        default_value = "Org1MSP"
    )]
    pub msp_id: String,

    #[arg(
        long = "peer-id",
        global = true,
        env = "STP_PEER_ID",
        value_name = "PEER",
        default_value = "peer1.example.com"
    )]
    pub peer_id: String,

    #[arg(
        long = "channel",
        global = true,
        env = "STP_CHANNELS",
        value_name = "CHANNEL",
        value_delimiter = ',',
        default_value = "mychannel"
    )]
    pub channels: Vec<String>,

    #[arg(
        long = "config-chaincode",
        global = true,
        env = "STP_CONFIG_CHAINCODE",
        value_name = "NAME",
        default_value = crate::config_store::DEFAULT_CONFIG_CHAINCODE
    )]
    pub config_chaincode: String,

    /// Used when a namespace's application config does not set `batchWriterTimeout`.
    #[arg(
        long = "batch-writer-timeout-ms",
        global = true,
        env = "STP_BATCH_WRITER_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..=600_000)
    )]
    pub batch_writer_timeout_ms: u64,

    #[arg(
        long = "event-queue-capacity",
        global = true,
        env = "STP_EVENT_QUEUE_CAPACITY",
        value_name = "N",
        default_value_t = 64,
        value_parser = clap::value_parser!(u64).range(1..=65_536)
    )]
    pub event_queue_capacity: u64,

    #[arg(
        long = "reconcile-debounce-ms",
        global = true,
        env = "STP_RECONCILE_DEBOUNCE_MS",
        value_name = "MS",
        default_value_t = 50,
        value_parser = clap::value_parser!(u64).range(0..=10_000)
    )]
    pub reconcile_debounce_ms: u64,

    #[arg(
        long = "reconcile-max-retries",
        global = true,
        env = "STP_RECONCILE_MAX_RETRIES",
        value_name = "N",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(0..=100)
    )]
    pub reconcile_max_retries: u32,

    /// YAML or JSON file with config records to preload into the in-memory ledger.
    #[arg(long, global = true, env = "STP_SEED", value_name = "PATH")]
    pub seed: Option<PathBuf>,
}
