//! Halcyon full node daemon.
//!
//! Opens the storage environment, bootstraps or loads the chain state,
//! and parks in a housekeeping loop until shut down. Socket plumbing
//! attaches through the handler interface in `halcyon-network`.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use tracing::{error, info};

use halcyon_core::params::{Network, Params};
use halcyon_node::chain::ChainState;
use halcyon_node::config::NodeConfig;
use halcyon_node::txdb::DbEnvironment;

/// Halcyon full node.
#[derive(Parser, Debug)]
#[command(name = "halcyond", version, about = "Halcyon full node daemon")]
struct Args {
    /// Data directory for chain storage
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// Connect to the public test network instead of mainnet
    #[arg(long)]
    testnet: bool,

    /// Thousand-bytes per minute of fee-free transaction relay
    #[arg(long = "limitfreerelay", default_value_t = 15)]
    limit_free_relay: i64,

    /// Cap on the orphan-transaction map
    #[arg(long = "maxorphantx", default_value_t = 100)]
    max_orphan_tx: usize,

    /// Cap on the orphan-block map
    #[arg(long = "maxorphanblocks", default_value_t = 750)]
    max_orphan_blocks: usize,

    /// Fee floor for transactions this node creates
    #[arg(long = "mintxfee", default_value_t = 10_000)]
    min_tx_fee: i64,

    /// Largest block template this node assembles
    #[arg(long = "blockmaxsize", default_value_t = 500_000)]
    block_max_size: usize,

    /// Template bytes reserved for high-priority transactions
    #[arg(long = "blockprioritysize", default_value_t = 27_000)]
    block_priority_size: usize,

    /// Minimum template fill before fee filtering
    #[arg(long = "blockminsize", default_value_t = 0)]
    block_min_size: usize,

    /// Command run on each new tip; %s is replaced by the block hash
    #[arg(long = "blocknotify")]
    block_notify: Option<String>,

    /// Adjust the local clock from peer time samples
    #[arg(long = "synctime", default_value_t = true)]
    sync_time: bool,

    /// Header version for mined blocks (regression-test chains only)
    #[arg(long = "blockversion", default_value_t = 6)]
    block_version: i32,

    /// Accept delegated staking scripts
    #[arg(long = "coldstaking", default_value_t = true)]
    cold_staking: bool,

    /// Drop one in N peer messages (debugging aid; 0 disables)
    #[arg(long = "dropmessagestest", default_value_t = 0)]
    drop_messages_test: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn network(&self) -> Network {
        if self.testnet { Network::Testnet } else { Network::Mainnet }
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            let suffix = match self.network() {
                Network::Mainnet => "mainnet",
                Network::Testnet => "testnet",
            };
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("halcyon")
                .join(suffix)
        })
    }

    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            limit_free_relay: self.limit_free_relay,
            max_orphan_tx: self.max_orphan_tx,
            max_orphan_blocks: self.max_orphan_blocks,
            min_tx_fee: self.min_tx_fee,
            block_max_size: self.block_max_size,
            block_priority_size: self.block_priority_size,
            block_min_size: self.block_min_size,
            block_notify: self.block_notify.clone(),
            sync_time: self.sync_time,
            block_version: self.block_version,
            cold_staking: self.cold_staking,
            drop_messages_test: self.drop_messages_test,
            ..NodeConfig::default()
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let network = args.network();
    let data_dir = args.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let env = DbEnvironment::open(data_dir.join("chainstate"))
        .context("opening storage environment")?;
    let params = Params::new(network);
    let chain = ChainState::open(env, params, args.node_config())
        .map_err(|e| anyhow::anyhow!("loading chain state: {e}"))?;
    let chain = Arc::new(Mutex::new(chain));

    info!(
        network = ?network,
        height = chain.lock().best().height,
        tip = %chain.lock().best().hash,
        "halcyond started"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        // stdin EOF doubles as a shutdown trigger for foreground runs;
        // service managers send SIGTERM which terminates the sleep loop
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    // housekeeping loop: the socket layer drives handlers concurrently;
    // this thread only watches for shutdown
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(500));
    }

    info!("shutdown requested, flushing");
    drop(chain);
    Ok(())
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .init();

    if let Err(err) = run(args) {
        error!(%err, "fatal");
        process::exit(1);
    }
}
