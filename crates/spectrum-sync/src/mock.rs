//! Mock implementations for testing

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::{
    Block, InternalTx, NodeAdapter, StorageAdapter, Store, SyncError, SyncResult, TokenTransfer,
    Transaction, TxReceipt, TxTrace, Uncle,
};

/// Mock node serving an in-memory chain
#[derive(Debug, Clone, Default)]
pub struct MockNode {
    blocks: Arc<RwLock<BTreeMap<u64, Block>>>,
    uncles: Arc<RwLock<HashMap<u64, Vec<Uncle>>>>,
    receipts: Arc<RwLock<HashMap<String, TxReceipt>>>,
    traces: Arc<RwLock<HashMap<String, InternalTx>>>,
    failing_traces: Arc<RwLock<HashSet<String>>>,
    trace_requests: Arc<RwLock<HashMap<String, usize>>>,
    tip_override: Arc<RwLock<Option<u64>>>,
    failing_heights: Arc<RwLock<HashSet<u64>>>,
    block_requests: Arc<RwLock<HashMap<u64, usize>>>,
    disconnected: Arc<RwLock<bool>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the block at `block.number`.
    pub fn add_block(&self, block: Block) {
        self.blocks.write().unwrap().insert(block.number, block);
    }

    pub fn add_uncles(&self, height: u64, uncles: Vec<Uncle>) {
        self.uncles.write().unwrap().insert(height, uncles);
    }

    pub fn add_receipt(&self, hash: &str, receipt: TxReceipt) {
        self.receipts
            .write()
            .unwrap()
            .insert(hash.to_string(), receipt);
    }

    pub fn add_trace(&self, hash: &str, trace: InternalTx) {
        self.traces.write().unwrap().insert(hash.to_string(), trace);
    }

    /// Make tracing `hash` fail until cleared.
    pub fn fail_trace(&self, hash: &str, failing: bool) {
        let mut failing_traces = self.failing_traces.write().unwrap();
        if failing {
            failing_traces.insert(hash.to_string());
        } else {
            failing_traces.remove(hash);
        }
    }

    /// How many times `hash` has been traced.
    pub fn trace_requests(&self, hash: &str) -> usize {
        self.trace_requests
            .read()
            .unwrap()
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    /// Report `tip` as the head instead of the highest stored block.
    pub fn set_tip(&self, tip: Option<u64>) {
        *self.tip_override.write().unwrap() = tip;
    }

    /// Make block fetches at `height` fail until cleared.
    pub fn fail_block(&self, height: u64, failing: bool) {
        let mut failing_heights = self.failing_heights.write().unwrap();
        if failing {
            failing_heights.insert(height);
        } else {
            failing_heights.remove(&height);
        }
    }

    pub fn set_connected(&self, connected: bool) {
        *self.disconnected.write().unwrap() = !connected;
    }

    /// Replace every block from `from_height` up with `new_blocks`.
    pub fn simulate_reorg(&self, from_height: u64, new_blocks: Vec<Block>) {
        let mut blocks = self.blocks.write().unwrap();
        blocks.retain(|&height, _| height < from_height);
        for block in new_blocks {
            blocks.insert(block.number, block);
        }
    }

    /// How many times the block at `height` has been requested.
    pub fn block_requests(&self, height: u64) -> usize {
        self.block_requests
            .read()
            .unwrap()
            .get(&height)
            .copied()
            .unwrap_or(0)
    }

    fn check_connected(&self) -> SyncResult<()> {
        if *self.disconnected.read().unwrap() {
            Err(SyncError::Node("Node not connected".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NodeAdapter for MockNode {
    async fn latest_block_number(&self) -> SyncResult<u64> {
        self.check_connected()?;
        if let Some(tip) = *self.tip_override.read().unwrap() {
            return Ok(tip);
        }
        let blocks = self.blocks.read().unwrap();
        blocks
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| SyncError::Node("Node has no blocks".to_string()))
    }

    async fn get_block_by_height(&self, height: u64) -> SyncResult<Block> {
        self.check_connected()?;
        *self
            .block_requests
            .write()
            .unwrap()
            .entry(height)
            .or_default() += 1;

        if self.failing_heights.read().unwrap().contains(&height) {
            return Err(SyncError::Node(format!("Block {} unavailable", height)));
        }

        let blocks = self.blocks.read().unwrap();
        blocks
            .get(&height)
            .cloned()
            .ok_or_else(|| SyncError::Node(format!("Block {} not found", height)))
    }

    async fn get_uncles_in_block(&self, hashes: &[String], height: u64) -> SyncResult<Vec<Uncle>> {
        self.check_connected()?;
        let uncles = self
            .uncles
            .read()
            .unwrap()
            .get(&height)
            .cloned()
            .unwrap_or_default();
        if uncles.len() != hashes.len() {
            return Err(SyncError::Node(format!(
                "Block {} references {} uncles, node has {}",
                height,
                hashes.len(),
                uncles.len()
            )));
        }
        Ok(uncles)
    }

    async fn get_tx_receipt(&self, hash: &str) -> SyncResult<TxReceipt> {
        self.check_connected()?;
        self.receipts
            .read()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| SyncError::Node(format!("Receipt {} not found", hash)))
    }

    async fn trace_transaction(&self, hash: &str) -> SyncResult<InternalTx> {
        self.check_connected()?;
        *self
            .trace_requests
            .write()
            .unwrap()
            .entry(hash.to_string())
            .or_default() += 1;

        if self.failing_traces.read().unwrap().contains(hash) {
            return Err(SyncError::Node(format!("Trace {} timed out", hash)));
        }
        self.traces
            .read()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| SyncError::Node(format!("Trace {} not found", hash)))
    }

    async fn is_connected(&self) -> bool {
        !*self.disconnected.read().unwrap()
    }
}

/// Mock storage keeping every collection in memory
#[derive(Debug, Clone, Default)]
pub struct MockStorage {
    blocks: Arc<RwLock<BTreeMap<u64, Block>>>,
    forked: Arc<RwLock<Vec<Block>>>,
    transactions: Arc<RwLock<BTreeMap<String, Transaction>>>,
    deployed_contracts: Arc<RwLock<Vec<Transaction>>>,
    contract_calls: Arc<RwLock<Vec<Transaction>>>,
    token_transfers: Arc<RwLock<Vec<TokenTransfer>>>,
    uncles: Arc<RwLock<Vec<Uncle>>>,
    traces: Arc<RwLock<BTreeMap<(u64, String), TxTrace>>>,
    store: Arc<RwLock<Option<Store>>>,
    fail_reads: Arc<RwLock<bool>>,
    fail_trace_writes: Arc<RwLock<bool>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make block reads fail, to exercise the engine's error paths.
    pub fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.write().unwrap() = fail;
    }

    /// Make trace writes fail.
    pub fn set_fail_trace_writes(&self, fail: bool) {
        *self.fail_trace_writes.write().unwrap() = fail;
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.read().unwrap().values().cloned().collect()
    }

    pub fn forked(&self) -> Vec<Block> {
        self.forked.read().unwrap().clone()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.read().unwrap().values().cloned().collect()
    }

    pub fn deployed_contracts(&self) -> Vec<Transaction> {
        self.deployed_contracts.read().unwrap().clone()
    }

    pub fn contract_calls(&self) -> Vec<Transaction> {
        self.contract_calls.read().unwrap().clone()
    }

    pub fn token_transfers(&self) -> Vec<TokenTransfer> {
        self.token_transfers.read().unwrap().clone()
    }

    pub fn uncles(&self) -> Vec<Uncle> {
        self.uncles.read().unwrap().clone()
    }

    /// Stored traces ordered by origin block, then hash.
    pub fn tx_traces(&self) -> Vec<TxTrace> {
        self.traces.read().unwrap().values().cloned().collect()
    }

    fn check_reads(&self) -> SyncResult<()> {
        if *self.fail_reads.read().unwrap() {
            Err(SyncError::Storage("Storage read failed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageAdapter for MockStorage {
    async fn latest_block(&self) -> SyncResult<Option<Block>> {
        self.check_reads()?;
        Ok(self.blocks.read().unwrap().values().next_back().cloned())
    }

    async fn block_by_number(&self, number: u64) -> SyncResult<Option<Block>> {
        self.check_reads()?;
        Ok(self.blocks.read().unwrap().get(&number).cloned())
    }

    async fn block_by_hash(&self, hash: &str) -> SyncResult<Option<Block>> {
        self.check_reads()?;
        Ok(self
            .blocks
            .read()
            .unwrap()
            .values()
            .find(|b| b.hash == hash)
            .cloned())
    }

    async fn add_block(&self, block: &Block) -> SyncResult<()> {
        self.blocks
            .write()
            .unwrap()
            .insert(block.number, block.clone());
        Ok(())
    }

    async fn add_forked_block(&self, block: &Block) -> SyncResult<()> {
        self.forked.write().unwrap().push(block.clone());
        Ok(())
    }

    async fn forked_blocks(&self, number: u64) -> SyncResult<Vec<Block>> {
        Ok(self
            .forked
            .read()
            .unwrap()
            .iter()
            .filter(|b| b.number == number)
            .cloned()
            .collect())
    }

    async fn purge_block(&self, number: u64) -> SyncResult<()> {
        self.blocks.write().unwrap().remove(&number);
        Ok(())
    }

    async fn add_transaction(&self, tx: &Transaction) -> SyncResult<()> {
        self.transactions
            .write()
            .unwrap()
            .insert(tx.hash.clone(), tx.clone());
        Ok(())
    }

    async fn add_deployed_contract(&self, tx: &Transaction) -> SyncResult<()> {
        self.deployed_contracts.write().unwrap().push(tx.clone());
        Ok(())
    }

    async fn add_contract_call(&self, tx: &Transaction) -> SyncResult<()> {
        self.contract_calls.write().unwrap().push(tx.clone());
        Ok(())
    }

    async fn add_token_transfer(&self, transfer: &TokenTransfer) -> SyncResult<()> {
        self.token_transfers.write().unwrap().push(transfer.clone());
        Ok(())
    }

    async fn add_uncle(&self, uncle: &Uncle) -> SyncResult<()> {
        self.uncles.write().unwrap().push(uncle.clone());
        Ok(())
    }

    async fn canonical_tx_hashes(&self, from: u64, to: u64) -> SyncResult<Vec<(u64, String)>> {
        self.check_reads()?;
        let blocks = self.blocks.read().unwrap();
        let mut hashes: Vec<(u64, u64, String)> = self
            .transactions
            .read()
            .unwrap()
            .values()
            .filter(|tx| {
                (from..=to).contains(&tx.block_number)
                    && blocks
                        .get(&tx.block_number)
                        .is_some_and(|b| b.hash == tx.block_hash)
            })
            .map(|tx| (tx.block_number, tx.transaction_index, tx.hash.clone()))
            .collect();
        hashes.sort();
        Ok(hashes
            .into_iter()
            .map(|(number, _, hash)| (number, hash))
            .collect())
    }

    async fn add_tx_traces(&self, traces: &[TxTrace]) -> SyncResult<()> {
        if *self.fail_trace_writes.read().unwrap() {
            return Err(SyncError::Storage("Trace write failed".to_string()));
        }
        let mut stored = self.traces.write().unwrap();
        for trace in traces {
            stored.insert(
                (trace.origin_block_no, trace.origin_tx_hash.clone()),
                trace.clone(),
            );
        }
        Ok(())
    }

    async fn latest_tx_trace(&self) -> SyncResult<Option<TxTrace>> {
        self.check_reads()?;
        Ok(self.traces.read().unwrap().values().next_back().cloned())
    }

    async fn store(&self) -> SyncResult<Option<Store>> {
        Ok(self.store.read().unwrap().clone())
    }

    async fn update_store(&self, store: &Store) -> SyncResult<()> {
        *self.store.write().unwrap() = Some(store.clone());
        Ok(())
    }

    async fn is_available(&self) -> bool {
        !*self.fail_reads.read().unwrap()
    }
}
