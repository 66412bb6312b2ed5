//! # Spectrum-Mono: chain indexer binary
//!
//! Wires the generic [`spectrum_sync::ChainSync`] engine to a JSON-RPC node
//! and a RocksDB store, and runs sync cycles on a fixed interval until a
//! shutdown is requested.
//!
//! See [`Args`] for the command-line and environment options.

pub mod adapters;

use alloy_primitives::U256;
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{info, warn};
use rocksdb::{Options, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::adapters::{JsonRpcNodeAdapter, RocksDBStorageAdapter};
use spectrum_sync::{
    ChainSync, NodeAdapter, StorageAdapter, SyncConfig, SyncContext, TraceConfig,
    UBIQ_GENESIS_SUPPLY,
};

/// Command-line arguments for `spectrum-mono`.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "SPECTRUM_RPC_URL", default_value = "http://127.0.0.1:8588")]
    pub rpc_url: String,
    #[arg(long, env = "SPECTRUM_RPC_TIMEOUT_MS", default_value_t = 10_000)]
    pub rpc_timeout_ms: u64,
    #[arg(long, help = "Retries for a failed RPC transport", default_value_t = 5)]
    pub rpc_retries: u32,
    #[arg(long, env = "SPECTRUM_DB_PATH")]
    pub db_path: PathBuf,
    #[arg(
        long,
        env = "SPECTRUM_ROUTINES",
        help = "Outstanding block tasks per cycle (default: auto-determined based on CPU cores)"
    )]
    pub routines: Option<usize>,
    #[arg(
        long,
        help = "Upper bound on concurrent transaction tasks per block",
        default_value_t = 64
    )]
    pub tx_routines: usize,
    #[arg(long, env = "SPECTRUM_INTERVAL_SECS", default_value_t = 5)]
    pub interval_secs: u64,
    #[arg(long, default_value = "UBQ")]
    pub symbol: String,
    #[arg(
        long,
        help = "Supply credited to the genesis block, in wei",
        default_value = UBIQ_GENESIS_SUPPLY
    )]
    pub genesis_supply: String,
    #[arg(
        long,
        help = "Store transactions with empty receipt fields instead of aborting the block"
    )]
    pub best_effort_receipts: bool,
    #[arg(long, help = "Recent blocks kept in the state cache", default_value_t = 10)]
    pub cache_size: usize,
    #[arg(long, help = "Blocks per progress log line", default_value_t = 1000)]
    pub log_batch: usize,
    #[arg(long, help = "Stop after this many sync cycles")]
    pub exit_after_cycles: Option<u64>,
    #[arg(
        long,
        env = "SPECTRUM_TRACE",
        help = "Trace transactions with debug_traceTransaction after each block sync"
    )]
    pub trace: bool,
    #[arg(long, help = "First block whose transactions are traced", default_value_t = 0)]
    pub trace_start_block: u64,
    #[arg(long, help = "Blocks per trace pipeline", default_value_t = 500)]
    pub trace_batch_blocks: u64,
    #[arg(long, help = "Outstanding trace tasks per batch", default_value_t = 25)]
    pub trace_routines: usize,
}

impl Args {
    /// Build the engine configuration from the parsed arguments.
    pub fn sync_config(&self) -> Result<SyncConfig> {
        let genesis_supply = U256::from_str_radix(&self.genesis_supply, 10)
            .map_err(|e| anyhow!("invalid genesis supply {}: {}", self.genesis_supply, e))?;

        if self.interval_secs == 0 {
            return Err(anyhow!("sync interval must be at least one second"));
        }

        let defaults = SyncConfig::default();
        Ok(SyncConfig {
            max_routines: self.routines.unwrap_or(defaults.max_routines).max(1),
            max_tx_routines: self.tx_routines.max(1),
            strict_receipts: !self.best_effort_receipts,
            cache_capacity: self.cache_size.max(1),
            genesis_supply,
            symbol: self.symbol.clone(),
            log_batch_blocks: self.log_batch.max(1),
            interval: Duration::from_secs(self.interval_secs),
            tracing: TraceConfig {
                enabled: self.trace,
                start_block: self.trace_start_block,
                batch_blocks: self.trace_batch_blocks.max(1),
                max_routines: self.trace_routines.max(1),
            },
            ..defaults
        })
    }
}

/// RocksDB options scaled to the available cores.
pub fn db_options() -> Options {
    let available_cpus = num_cpus::get();
    let background_jobs = std::cmp::min(std::cmp::max(4, available_cpus / 4), 16) as i32;
    let write_buffer_number = std::cmp::min(std::cmp::max(6, available_cpus / 6), 12) as i32;

    info!(
        "Configuring RocksDB with {} background jobs and {} write buffers",
        background_jobs, write_buffer_number
    );

    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_max_open_files(10000);
    opts.set_use_fsync(false);
    opts.set_bytes_per_sync(8388608); // 8MB
    opts.set_table_cache_num_shard_bits(6);
    opts.set_max_write_buffer_number(write_buffer_number);
    opts.set_write_buffer_size(64 * 1024 * 1024);
    opts.set_target_file_size_base(64 * 1024 * 1024);
    opts.set_level_zero_file_num_compaction_trigger(4);
    opts.set_level_zero_slowdown_writes_trigger(20);
    opts.set_level_zero_stop_writes_trigger(30);
    opts.set_max_background_jobs(background_jobs);
    opts
}

pub fn open_db(path: &Path) -> Result<Arc<DB>> {
    let db = DB::open(&db_options(), path)
        .map_err(|e| anyhow!("failed to open database at {}: {}", path.display(), e))?;
    Ok(Arc::new(db))
}

/// Run the sync loop against the given adapters until `shutdown` flips.
pub async fn run_with<N, S>(
    node: Arc<N>,
    storage: Arc<S>,
    config: SyncConfig,
    shutdown: watch::Receiver<bool>,
    max_cycles: Option<u64>,
) -> Result<()>
where
    N: NodeAdapter + 'static,
    S: StorageAdapter + 'static,
{
    if !node.is_connected().await {
        warn!("node is not answering yet; sync will keep retrying each cycle");
    }
    if !storage.is_available().await {
        return Err(anyhow!("storage is not available"));
    }

    let sync = ChainSync::new(node, storage, config);
    let ctx = SyncContext::new();
    sync.run_loop(&ctx, shutdown, max_cycles).await;
    Ok(())
}

/// Entry point used by the binary.
pub async fn run(args: Args, shutdown: watch::Receiver<bool>) -> Result<()> {
    let config = args.sync_config()?;
    info!(
        "Starting spectrum-mono with {} block routines, {} tx routines, interval {:?}",
        config.max_routines, config.max_tx_routines, config.interval
    );
    if config.tracing.enabled {
        info!(
            "Tracing transactions from block {} in batches of {} blocks",
            config.tracing.start_block, config.tracing.batch_blocks
        );
    }

    let node = JsonRpcNodeAdapter::new(
        args.rpc_url.clone(),
        Duration::from_millis(args.rpc_timeout_ms),
    )?
    .with_retries(args.rpc_retries, Duration::from_millis(500));
    info!("Using node at {}", node.rpc_url());

    let db = open_db(&args.db_path)?;
    let storage = RocksDBStorageAdapter::new(db);

    run_with(
        Arc::new(node),
        Arc::new(storage),
        config,
        shutdown,
        args.exit_after_cycles,
    )
    .await?;

    info!("spectrum-mono stopped");
    Ok(())
}
