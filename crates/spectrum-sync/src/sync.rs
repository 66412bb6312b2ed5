//! # Chain Synchronization Engine
//!
//! [`ChainSync`] imports a node's canonical chain into a [`StorageAdapter`],
//! one *cycle* at a time. A cycle reads the last committed height, asks the
//! node for its head, and pushes every missing height through one
//! [`Synchronizer`] pipeline:
//!
//! - **Fetch** (unordered): `get_block_by_height`, concurrently for up to
//!   `max_routines` heights.
//! - **Commit** (ordered): continuity check against the parent's committed
//!   hash, uncle and reward accounting, the nested transaction pipeline, and
//!   finally the block write and cache update.
//!
//! ## Reorganizations
//!
//! A fetched block whose parent hash differs from the committed hash at
//! `height - 1` means the stored block at `height - 1` is no longer canonical.
//! The engine purges the recent-state cache, moves that block to the forked
//! archive, deletes it from the canonical store, and aborts the pipeline. The
//! next cycle resumes from the new last committed height and walks back one
//! block per cycle until continuity holds again.
//!
//! ## Failure Model
//!
//! Nothing here terminates the process. A failed block fetch, a missing
//! parent, a failed block write, or (with strict receipts) a failed receipt
//! fetch aborts the cycle; the next tick starts over from storage.
//!
//! ## Scheduling
//!
//! [`ChainSync::run_loop`] runs a cycle immediately and then on a fixed
//! interval until shutdown. With tracing enabled each cycle is followed by a
//! [trace pass](crate::traces). A [`SyncContext`] owned by the caller keeps cycles
//! on the same engine from overlapping.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};

use crate::segment_log::{SegmentEvent, SegmentLogger, SegmentSink, SegmentTotals};
use crate::transactions::{process_transactions, FanoutConfig};
use crate::utils::now_millis;
use crate::{
    accumulate_rewards, Block, BlockCache, CachedBlock, MonetaryPolicy, NodeAdapter,
    StorageAdapter, Store, SyncConfig, SyncError, SyncResult, Synchronizer, Task,
};
use alloy_primitives::U256;

/// Per-engine "cycle in progress" flag.
#[derive(Debug, Default)]
pub struct SyncContext {
    syncing: AtomicBool,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Mark a cycle as started, unless one already is.
    ///
    /// The flag is cleared when the returned guard drops, whatever way the
    /// cycle ends.
    pub fn try_begin(&self) -> Option<SyncGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SyncGuard { ctx: self })
    }
}

pub struct SyncGuard<'a> {
    ctx: &'a SyncContext,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.ctx.syncing.store(false, Ordering::SeqCst);
    }
}

/// Counts a cycle's reorgs take back out of the summary record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Unwound {
    txns: u64,
    token_transfers: u64,
    uncles: u64,
}

/// How a sync cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle held the context.
    Busy,
    /// Storage already matched the node head.
    UpToDate { height: u64 },
    /// Every height in `from..=to` was committed.
    Completed {
        from: u64,
        to: u64,
        totals: SegmentTotals,
    },
    /// The pipeline aborted; `totals` covers what was committed before it.
    Aborted {
        from: u64,
        to: u64,
        totals: SegmentTotals,
    },
}

impl CycleOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, CycleOutcome::Aborted { .. })
    }

    pub fn committed(&self) -> u64 {
        match self {
            CycleOutcome::Completed { totals, .. } | CycleOutcome::Aborted { totals, .. } => {
                totals.blocks
            }
            _ => 0,
        }
    }
}

/// Chain sync engine, generic over its node and storage adapters.
pub struct ChainSync<N, S>
where
    N: NodeAdapter,
    S: StorageAdapter,
{
    pub(crate) node: Arc<N>,
    pub(crate) storage: Arc<S>,
    pub(crate) config: Arc<SyncConfig>,
    policy: Arc<MonetaryPolicy>,
    cache: Arc<Mutex<BlockCache>>,
}

impl<N, S> Clone for ChainSync<N, S>
where
    N: NodeAdapter,
    S: StorageAdapter,
{
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            storage: self.storage.clone(),
            config: self.config.clone(),
            policy: self.policy.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<N, S> ChainSync<N, S>
where
    N: NodeAdapter + 'static,
    S: StorageAdapter + 'static,
{
    pub fn new(node: Arc<N>, storage: Arc<S>, config: SyncConfig) -> Self {
        Self::with_policy(node, storage, config, MonetaryPolicy::default())
    }

    pub fn with_policy(
        node: Arc<N>,
        storage: Arc<S>,
        config: SyncConfig,
        policy: MonetaryPolicy,
    ) -> Self {
        let cache = BlockCache::new(config.cache_capacity);
        Self {
            node,
            storage,
            config: Arc::new(config),
            policy: Arc::new(policy),
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn node(&self) -> &Arc<N> {
        &self.node
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Number of heights currently held in the recent-state cache.
    pub async fn cached_heights(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Run one sync cycle.
    ///
    /// Errors are only returned for failures before the pipeline starts
    /// (reading the stored head, the node head, or importing genesis).
    pub async fn run_cycle(&self, ctx: &SyncContext) -> SyncResult<CycleOutcome> {
        let Some(_guard) = ctx.try_begin() else {
            warn!("Sync already in progress; skipping cycle");
            return Ok(CycleOutcome::Busy);
        };

        let head = match self.storage.latest_block().await? {
            Some(head) => head,
            None => self.init_genesis().await?,
        };
        debug!("fetched head from storage: {}", head.number);

        let tip = self.node.latest_block_number().await?;
        if head.number >= tip {
            debug!("storage is at node head {}", tip);
            return Ok(CycleOutcome::UpToDate {
                height: head.number,
            });
        }

        let from = head.number + 1;
        info!("Syncing blocks {} to {}", from, tip);

        let segments = SegmentLogger::start(self.config.log_batch_blocks, self.config.log_interval);
        let pipeline = Synchronizer::new(self.config.max_routines);
        let unwound = Arc::new(Mutex::new(Unwound::default()));

        for height in from..=tip {
            let engine = self.clone();
            let sink = segments.sink();
            let unwound = unwound.clone();
            let admitted = pipeline
                .add_link(move |mut task| async move {
                    let block = match engine.node.get_block_by_height(height).await {
                        Ok(block) => block,
                        Err(e) => {
                            error!("failed getting block {}: {}", height, e);
                            task.abort();
                            return;
                        }
                    };

                    if task.wait().await {
                        debug!("Aborting routine for block {}", height);
                        return;
                    }

                    engine.commit_block(block, &task, &sink, &unwound).await;
                })
                .await;

            if !admitted {
                debug!("pipeline aborted; not enqueuing past block {}", height - 1);
                break;
            }
        }

        let aborted = pipeline.finish().await;
        let totals = segments.close().await;
        let unwound = *unwound.lock().await;

        // An aborted cycle may have moved the head back, so refresh either way.
        if let Err(e) = self.refresh_store(&totals, &unwound).await {
            error!("Error updating store: {}", e);
        }

        if aborted {
            error!("sync aborted after committing {} blocks", totals.blocks);
            Ok(CycleOutcome::Aborted {
                from,
                to: tip,
                totals,
            })
        } else {
            info!("Synced blocks {} to {}", from, tip);
            Ok(CycleOutcome::Completed {
                from,
                to: tip,
                totals,
            })
        }
    }

    /// Ordered phase for one block.
    async fn commit_block(
        &self,
        mut block: Block,
        task: &Task,
        sink: &SegmentSink,
        unwound: &Mutex<Unwound>,
    ) {
        let parent = match self.previous_block(block.number).await {
            Ok(parent) => parent,
            Err(e) => {
                error!("couldn't get previous block: {}", e);
                task.abort();
                return;
            }
        };

        if parent.hash != block.parent_hash {
            match self.handle_reorg(&block).await {
                Ok(forked) => {
                    let mut unwound = unwound.lock().await;
                    unwound.txns += forked.txs as u64;
                    unwound.token_transfers += forked.token_transfers as u64;
                    unwound.uncles += forked.uncle_no as u64;
                }
                Err(e) => error!("{}", e),
            }
            task.abort();
            return;
        }

        let uncles = if block.uncles.is_empty() {
            Vec::new()
        } else {
            match self
                .node
                .get_uncles_in_block(&block.uncles, block.number)
                .await
            {
                Ok(uncles) => uncles,
                Err(e) => {
                    error!("couldn't get uncles for block {}: {}", block.number, e);
                    Vec::new()
                }
            }
        };

        let rewards = accumulate_rewards(&block, &uncles, &self.policy);
        let supply = (parent.supply + rewards.minted).saturating_sub(block.burned);
        let total_burned = parent.total_burned + block.burned;

        let summary = process_transactions(
            self.node.clone(),
            self.storage.clone(),
            &block,
            FanoutConfig {
                max_routines: self.config.max_tx_routines,
                strict_receipts: self.config.strict_receipts,
            },
        )
        .await;

        if summary.aborted {
            error!(
                "transaction processing failed for block {}; not committing",
                block.number
            );
            task.abort();
            return;
        }

        for (idx, uncle) in uncles.iter().enumerate() {
            let mut uncle = uncle.clone();
            uncle.block_number = block.number;
            uncle.position = idx as u64;
            uncle.reward = rewards.uncle_rewards[idx];
            if let Err(e) = self.storage.add_uncle(&uncle).await {
                error!("couldn't add uncle {}: {}", uncle.hash, e);
            }
        }

        block.token_transfers = summary.token_transfers as usize;
        block.avg_gas_price = summary.avg_gas_price;
        block.tx_fees = summary.tx_fees;
        block.block_reward = rewards.block_reward;
        block.uncle_rewards = rewards.uncle_total();
        block.minted = rewards.minted;
        block.supply = supply;
        block.total_burned = total_burned;

        if let Err(e) = self.storage.add_block(&block).await {
            error!("couldn't add block {}: {}", block.number, e);
            task.abort();
            return;
        }

        self.cache
            .lock()
            .await
            .insert(block.number, CachedBlock::from(&block));

        sink.log(SegmentEvent {
            block_no: block.number,
            txns: block.txs as u64,
            token_transfers: summary.token_transfers,
            contracts_deployed: summary.contracts_deployed,
            contract_calls: summary.contract_calls,
            uncles: block.uncle_no as u64,
            minted: block.minted,
            supply: block.supply,
        });
    }

    /// Committed state of the block before `number`, from cache or storage.
    async fn previous_block(&self, number: u64) -> SyncResult<CachedBlock> {
        let parent = number.checked_sub(1).ok_or_else(|| SyncError::BlockProcessing {
            height: number,
            message: "genesis has no parent".to_string(),
        })?;

        if let Some(cached) = self.cache.lock().await.get(parent) {
            return Ok(cached);
        }

        warn!(
            "block {} not found in cache, retrieving from database",
            parent
        );
        match self.storage.block_by_number(parent).await? {
            Some(block) => Ok(CachedBlock::from(&block)),
            None => Err(SyncError::Storage(format!(
                "block {} not found in database",
                parent
            ))),
        }
    }

    /// Unwind the stored block that `head` no longer builds on, returning it.
    async fn handle_reorg(&self, head: &Block) -> SyncResult<Block> {
        let reorg_height = head.number.saturating_sub(1);
        warn!("reorg detected at height {}", reorg_height);

        warn!("Purging block cache.");
        self.cache.lock().await.purge();

        let reorg_err = |message: String| SyncError::Reorg {
            height: reorg_height,
            message,
        };

        let forked = match self.storage.block_by_number(reorg_height).await {
            Ok(Some(block)) => block,
            Ok(None) => return Err(reorg_err("forked block not in storage".to_string())),
            Err(e) => return Err(reorg_err(format!("couldn't get forked block: {}", e))),
        };

        if let Err(e) = self.storage.add_forked_block(&forked).await {
            error!("couldn't add reorg'd block: {}", e);
        }

        self.storage
            .purge_block(reorg_height)
            .await
            .map_err(|e| reorg_err(format!("couldn't purge reorg'd block: {}", e)))?;

        warn!(
            "Synced forked block HEAD=(number: {}, hash: {}) FORKED=(number: {}, hash: {})",
            head.number, head.hash, forked.number, forked.hash
        );
        Ok(forked)
    }

    /// Import block 0 and initialise the summary record.
    async fn init_genesis(&self) -> SyncResult<Block> {
        info!("No blocks in storage; importing genesis");

        let mut genesis = self.node.get_block_by_height(0).await?;
        genesis.block_reward = U256::ZERO;
        genesis.uncle_rewards = U256::ZERO;
        genesis.avg_gas_price = U256::ZERO;
        genesis.tx_fees = U256::ZERO;
        genesis.minted = self.config.genesis_supply;
        genesis.supply = self.config.genesis_supply;
        genesis.burned = U256::ZERO;
        genesis.total_burned = U256::ZERO;

        self.storage.add_block(&genesis).await?;
        self.cache
            .lock()
            .await
            .insert(0, CachedBlock::from(&genesis));

        let store = Store {
            timestamp: now_millis(),
            symbol: self.config.symbol.clone(),
            supply: genesis.supply,
            latest_block: 0,
            latest_hash: genesis.hash.clone(),
            total_transactions: genesis.txs as u64,
            total_token_transfers: 0,
            total_uncles: 0,
        };
        self.storage.update_store(&store).await?;

        info!("Initialized genesis block {} with supply {}", genesis.hash, genesis.supply);
        Ok(genesis)
    }

    /// Fold a cycle's totals, minus what its reorgs unwound, and the latest
    /// committed block into the summary.
    async fn refresh_store(&self, totals: &SegmentTotals, unwound: &Unwound) -> SyncResult<()> {
        let Some(head) = self.storage.latest_block().await? else {
            return Ok(());
        };

        let mut store = self.storage.store().await?.unwrap_or_default();
        store.timestamp = now_millis();
        store.symbol = self.config.symbol.clone();
        store.supply = head.supply;
        store.latest_block = head.number;
        store.latest_hash = head.hash;
        store.total_transactions =
            (store.total_transactions + totals.txns).saturating_sub(unwound.txns);
        store.total_token_transfers = (store.total_token_transfers + totals.token_transfers)
            .saturating_sub(unwound.token_transfers);
        store.total_uncles = (store.total_uncles + totals.uncles).saturating_sub(unwound.uncles);

        self.storage.update_store(&store).await
    }

    /// Run cycles until `shutdown` flips to `true` or, if set, `max_cycles`
    /// have run.
    pub async fn run_loop(
        &self,
        ctx: &SyncContext,
        mut shutdown: watch::Receiver<bool>,
        max_cycles: Option<u64>,
    ) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "block sync interval set to {:?}, caching {} recent blocks",
            self.config.interval,
            self.cache.lock().await.capacity()
        );

        let mut cycles = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("Shutdown requested; stopping sync loop");
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle(ctx).await {
                Ok(outcome) => debug!("sync cycle finished: {:?}", outcome),
                Err(e) => error!("sync cycle failed: {}", e),
            }

            if self.config.tracing.enabled {
                match self.trace_cycle(ctx).await {
                    Ok(outcome) => debug!("trace pass finished: {:?}", outcome),
                    Err(e) => error!("trace pass failed: {}", e),
                }
            }

            cycles += 1;
            if max_cycles.is_some_and(|max| cycles >= max) {
                info!("Completed {} sync cycles; exiting loop", cycles);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockNode, MockStorage};
    use crate::{TxReceipt, Uncle};
    use std::time::Duration;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn hash(tag: &str, n: u64) -> String {
        format!("0x{}{:04x}", tag, n)
    }

    fn linked_block(n: u64, tag: &str, parent_tag: &str) -> Block {
        Block {
            number: n,
            hash: hash(tag, n),
            parent_hash: if n == 0 {
                String::new()
            } else {
                hash(parent_tag, n - 1)
            },
            ..Default::default()
        }
    }

    fn seed(node: &MockNode, range: std::ops::RangeInclusive<u64>, tag: &str) {
        for n in range {
            node.add_block(linked_block(n, tag, tag));
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            max_routines: 3,
            genesis_supply: U256::ZERO,
            interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn engine(node: &Arc<MockNode>, storage: &Arc<MockStorage>) -> ChainSync<MockNode, MockStorage> {
        ChainSync::new(node.clone(), storage.clone(), config())
    }

    fn eight() -> U256 {
        U256::from(8_000_000_000_000_000_000u64)
    }

    #[tokio::test]
    async fn test_sync_context_guard() {
        let ctx = SyncContext::new();
        {
            let _guard = ctx.try_begin().unwrap();
            assert!(ctx.is_syncing());
            assert!(ctx.try_begin().is_none());
        }
        assert!(!ctx.is_syncing());
    }

    #[tokio::test]
    async fn test_busy_context_skips_cycle() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=2, "a");
        let sync = engine(&node, &storage);

        let ctx = SyncContext::new();
        let _held = ctx.try_begin().unwrap();
        assert_eq!(sync.run_cycle(&ctx).await.unwrap(), CycleOutcome::Busy);
        assert!(storage.blocks().is_empty());
    }

    #[tokio::test]
    async fn test_genesis_bootstrap_and_store() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=3, "a");
        let sync = ChainSync::new(
            node.clone(),
            storage.clone(),
            SyncConfig {
                genesis_supply: U256::from(1000u64),
                ..config()
            },
        );

        let outcome = sync.run_cycle(&SyncContext::new()).await.unwrap();
        assert_eq!(outcome.committed(), 3);
        assert!(!outcome.is_aborted());

        let blocks = storage.blocks();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].supply, U256::from(1000u64));
        assert_eq!(blocks[0].minted, U256::from(1000u64));
        assert_eq!(blocks[3].supply, U256::from(1000u64) + eight() * U256::from(3u64));

        let store = storage.store().await.unwrap().unwrap();
        assert_eq!(store.latest_block, 3);
        assert_eq!(store.latest_hash, hash("a", 3));
        assert_eq!(store.supply, blocks[3].supply);
        assert_eq!(store.symbol, "UBQ");
    }

    #[tokio::test]
    async fn test_up_to_date_is_noop() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=2, "a");
        let sync = engine(&node, &storage);
        let ctx = SyncContext::new();

        sync.run_cycle(&ctx).await.unwrap();
        assert_eq!(
            sync.run_cycle(&ctx).await.unwrap(),
            CycleOutcome::UpToDate { height: 2 }
        );
        assert_eq!(node.block_requests(1), 1);
    }

    #[tokio::test]
    async fn test_reorg_moves_parent_to_forked_archive() {
        init_logging();
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=3, "a");
        let sync = engine(&node, &storage);
        let ctx = SyncContext::new();

        sync.run_cycle(&ctx).await.unwrap();
        assert!(sync.cached_heights().await > 0);

        // Block 3 is replaced by 3b, and 4b builds on it.
        node.simulate_reorg(
            3,
            vec![linked_block(3, "b", "a"), linked_block(4, "b", "b")],
        );

        let outcome = sync.run_cycle(&ctx).await.unwrap();
        assert!(outcome.is_aborted());
        assert_eq!(outcome.committed(), 0);
        assert_eq!(sync.cached_heights().await, 0);

        let forked = storage.forked();
        assert_eq!(forked.len(), 1);
        assert_eq!(forked[0].number, 3);
        assert_eq!(forked[0].hash, hash("a", 3));
        assert!(storage.block_by_number(3).await.unwrap().is_none());
        assert!(storage.block_by_number(4).await.unwrap().is_none());

        // Next cycle resumes from block 2 and adopts the new branch.
        let outcome = sync.run_cycle(&ctx).await.unwrap();
        assert_eq!(outcome.committed(), 2);
        assert_eq!(
            storage.block_by_number(4).await.unwrap().unwrap().hash,
            hash("b", 4)
        );
        assert_eq!(
            storage.block_by_number(4).await.unwrap().unwrap().supply,
            eight() * U256::from(4u64)
        );
    }

    #[tokio::test]
    async fn test_reorg_unwinds_store_totals() {
        init_logging();
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=2, "a");

        // Block 3a carries a token transfer and an uncle; its replacement is empty.
        let mut stale = linked_block(3, "a", "a");
        stale.transactions = vec![crate::RawTransaction {
            hash: "0xt3".to_string(),
            to: Some(hash("c", 0)),
            input: format!(
                "{}{:0>64}{:0>64}",
                crate::transactions::TRANSFER_SELECTOR,
                "bb",
                "64"
            ),
            ..Default::default()
        }];
        stale.txs = 1;
        stale.uncles = vec![hash("u", 2)];
        stale.uncle_no = 1;
        node.add_block(stale);
        node.add_uncles(
            3,
            vec![Uncle {
                number: 2,
                hash: hash("u", 2),
                ..Default::default()
            }],
        );
        node.add_receipt(
            "0xt3",
            TxReceipt {
                status: true,
                ..Default::default()
            },
        );

        let sync = engine(&node, &storage);
        let ctx = SyncContext::new();
        sync.run_cycle(&ctx).await.unwrap();
        let store = storage.store().await.unwrap().unwrap();
        assert_eq!(store.total_transactions, 1);
        assert_eq!(store.total_token_transfers, 1);
        assert_eq!(store.total_uncles, 1);

        node.simulate_reorg(
            3,
            vec![linked_block(3, "b", "a"), linked_block(4, "b", "b")],
        );

        // The aborted cycle already points the summary at the surviving head.
        assert!(sync.run_cycle(&ctx).await.unwrap().is_aborted());
        let store = storage.store().await.unwrap().unwrap();
        assert_eq!(store.latest_block, 2);
        assert_eq!(store.latest_hash, hash("a", 2));
        assert_eq!(store.supply, eight() * U256::from(2u64));

        sync.run_cycle(&ctx).await.unwrap();
        let blocks = storage.blocks();
        let store = storage.store().await.unwrap().unwrap();
        assert_eq!(store.latest_hash, hash("b", 4));
        assert_eq!(
            store.total_transactions,
            blocks.iter().map(|b| b.txs as u64).sum::<u64>()
        );
        assert_eq!(
            store.total_token_transfers,
            blocks.iter().map(|b| b.token_transfers as u64).sum::<u64>()
        );
        assert_eq!(
            store.total_uncles,
            blocks.iter().map(|b| b.uncle_no as u64).sum::<u64>()
        );
        assert_eq!(store.total_transactions, 0);
    }

    #[tokio::test]
    async fn test_block_fetch_failure_aborts_cycle() {
        init_logging();
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=6, "a");
        node.fail_block(4, true);
        let sync = engine(&node, &storage);
        let ctx = SyncContext::new();

        let outcome = sync.run_cycle(&ctx).await.unwrap();
        assert!(outcome.is_aborted());
        assert!(!ctx.is_syncing());
        // Blocks already released before the failure may commit; 4 never does.
        let head = storage.latest_block().await.unwrap().unwrap().number;
        assert!(head < 4);

        node.fail_block(4, false);
        let outcome = sync.run_cycle(&ctx).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed { to: 6, .. }));
        assert_eq!(storage.blocks().len(), 7);
        assert_eq!(
            storage.block_by_number(6).await.unwrap().unwrap().supply,
            eight() * U256::from(6u64)
        );
    }

    #[tokio::test]
    async fn test_cold_parent_lookup_from_storage() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=2, "a");
        engine(&node, &storage)
            .run_cycle(&SyncContext::new())
            .await
            .unwrap();

        // A fresh engine starts with an empty cache.
        seed(&node, 3..=4, "a");
        let fresh = engine(&node, &storage);
        let outcome = fresh.run_cycle(&SyncContext::new()).await.unwrap();
        assert_eq!(outcome.committed(), 2);
        assert_eq!(
            storage.block_by_number(4).await.unwrap().unwrap().supply,
            eight() * U256::from(4u64)
        );
    }

    #[tokio::test]
    async fn test_uncles_and_transactions_are_committed() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=1, "a");

        let mut block = linked_block(2, "a", "a");
        block.uncles = vec![hash("u", 1)];
        block.uncle_no = 1;
        block.transactions = vec![crate::RawTransaction {
            hash: "0xt1".to_string(),
            gas_price: "0x2".to_string(),
            input: "0x".to_string(),
            ..Default::default()
        }];
        block.txs = 1;
        node.add_block(block);
        node.add_uncles(
            2,
            vec![Uncle {
                number: 1,
                hash: hash("u", 1),
                ..Default::default()
            }],
        );
        node.add_receipt(
            "0xt1",
            TxReceipt {
                status: true,
                gas_used: 21_000,
                ..Default::default()
            },
        );

        let sync = engine(&node, &storage);
        let outcome = sync.run_cycle(&SyncContext::new()).await.unwrap();
        assert_eq!(outcome.committed(), 2);

        let stored = storage.block_by_number(2).await.unwrap().unwrap();
        let half = eight() / U256::from(2u64);
        let bonus = eight() / U256::from(32u64);
        assert_eq!(stored.uncle_rewards, half);
        assert_eq!(stored.block_reward, eight() + bonus);
        assert_eq!(stored.minted, eight() + bonus + half);
        assert_eq!(stored.tx_fees, U256::from(42_000u64));
        assert_eq!(stored.avg_gas_price, U256::from(2u64));

        let uncles = storage.uncles();
        assert_eq!(uncles.len(), 1);
        assert_eq!(uncles[0].block_number, 2);
        assert_eq!(uncles[0].reward, half);

        let store = storage.store().await.unwrap().unwrap();
        assert_eq!(store.total_uncles, 1);
        assert_eq!(store.total_transactions, 1);
    }

    #[tokio::test]
    async fn test_strict_receipt_failure_leaves_block_uncommitted() {
        init_logging();
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=1, "a");
        let mut block = linked_block(2, "a", "a");
        block.transactions = vec![crate::RawTransaction {
            hash: "0xmissing".to_string(),
            ..Default::default()
        }];
        block.txs = 1;
        node.add_block(block);

        let sync = engine(&node, &storage);
        let outcome = sync.run_cycle(&SyncContext::new()).await.unwrap();
        assert!(outcome.is_aborted());
        assert_eq!(storage.latest_block().await.unwrap().unwrap().number, 1);
    }

    #[tokio::test]
    async fn test_burned_value_reduces_supply() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=1, "a");
        let mut block = linked_block(2, "a", "a");
        block.burned = U256::from(1_000u64);
        node.add_block(block);

        let sync = engine(&node, &storage);
        sync.run_cycle(&SyncContext::new()).await.unwrap();

        let stored = storage.block_by_number(2).await.unwrap().unwrap();
        assert_eq!(stored.total_burned, U256::from(1_000u64));
        assert_eq!(
            stored.supply,
            eight() * U256::from(2u64) - U256::from(1_000u64)
        );
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=4, "a");
        let sync = engine(&node, &storage);
        let ctx = SyncContext::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = shutdown_tx.send(true);
        });

        tokio::time::timeout(Duration::from_secs(5), sync.run_loop(&ctx, shutdown_rx, None))
            .await
            .expect("loop should stop on shutdown");
        stopper.await.unwrap();
        assert_eq!(storage.blocks().len(), 5);
    }

    #[tokio::test]
    async fn test_run_loop_max_cycles() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        seed(&node, 0..=2, "a");
        let sync = engine(&node, &storage);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        sync.run_loop(&SyncContext::new(), shutdown_rx, Some(2))
            .await;
        assert_eq!(storage.blocks().len(), 3);
    }
}
