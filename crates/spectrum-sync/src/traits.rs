//! # Adapter Traits
//!
//! The sync engine never talks to a node or a database directly. It is generic
//! over two adapters:
//!
//! ### [`NodeAdapter`]
//! Read-only access to an Ethereum-style node: tip height, full blocks, uncle
//! headers, transaction receipts, and call traces. The production
//! implementation speaks JSON-RPC over HTTP; tests use an in-memory chain.
//!
//! ### [`StorageAdapter`]
//! The persistence layer: canonical blocks, the forked-blocks archive,
//! transactions, token transfers, uncles, transaction traces, and the rollup
//! [`Store`] record.
//!
//! Both traits take `&self` and are shared across concurrent tasks behind an
//! `Arc`, so implementations use interior mutability where they need it.
//!
//! ## Error Handling
//!
//! Node failures are reported as [`SyncError::Node`](crate::SyncError::Node)
//! and storage failures as [`SyncError::Storage`](crate::SyncError::Storage).
//! Lookups of records that do not exist return `Ok(None)`, never an error.

use crate::{
    Block, InternalTx, SyncResult, Store, TokenTransfer, Transaction, TxReceipt, TxTrace, Uncle,
};
use async_trait::async_trait;

/// Trait for node adapters that provide blockchain data.
#[async_trait]
pub trait NodeAdapter: Send + Sync {
    /// Height of the node's current head.
    async fn latest_block_number(&self) -> SyncResult<u64>;

    /// Full block at `height`, with its transaction list.
    ///
    /// # Errors
    /// Returns [`SyncError::Node`](crate::SyncError::Node) if the node is
    /// unreachable or has no block at that height.
    async fn get_block_by_height(&self, height: u64) -> SyncResult<Block>;

    /// Uncle headers referenced by the block at `height`, in list order.
    ///
    /// `hashes` is the including block's uncle hash list; implementations may
    /// fetch by index and use the hashes only for their length.
    async fn get_uncles_in_block(&self, hashes: &[String], height: u64) -> SyncResult<Vec<Uncle>>;

    /// Receipt of the transaction with the given hash.
    async fn get_tx_receipt(&self, hash: &str) -> SyncResult<TxReceipt>;

    /// Call trace of the transaction with the given hash.
    async fn trace_transaction(&self, hash: &str) -> SyncResult<InternalTx>;

    /// Check if the node is reachable.
    async fn is_connected(&self) -> bool;
}

/// Trait for storage backends.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Highest canonical block, if any has been stored.
    async fn latest_block(&self) -> SyncResult<Option<Block>>;

    async fn block_by_number(&self, number: u64) -> SyncResult<Option<Block>>;

    async fn block_by_hash(&self, hash: &str) -> SyncResult<Option<Block>>;

    /// Insert or overwrite the canonical block at `block.number`.
    async fn add_block(&self, block: &Block) -> SyncResult<()>;

    /// Archive a block that has been orphaned by a reorg.
    async fn add_forked_block(&self, block: &Block) -> SyncResult<()>;

    /// Archived forked blocks at `number`, oldest first.
    async fn forked_blocks(&self, number: u64) -> SyncResult<Vec<Block>>;

    /// Remove the canonical block at `number`.
    async fn purge_block(&self, number: u64) -> SyncResult<()>;

    async fn add_transaction(&self, tx: &Transaction) -> SyncResult<()>;

    async fn add_deployed_contract(&self, tx: &Transaction) -> SyncResult<()>;

    async fn add_contract_call(&self, tx: &Transaction) -> SyncResult<()>;

    async fn add_token_transfer(&self, transfer: &TokenTransfer) -> SyncResult<()>;

    async fn add_uncle(&self, uncle: &Uncle) -> SyncResult<()>;

    /// Hashes of the transactions in canonical blocks `from..=to`, as
    /// `(block number, tx hash)` in block and then transaction order.
    ///
    /// Transactions left behind by forked blocks are not returned.
    async fn canonical_tx_hashes(&self, from: u64, to: u64) -> SyncResult<Vec<(u64, String)>>;

    /// Persist one block's traces together; either all are written or none.
    async fn add_tx_traces(&self, traces: &[TxTrace]) -> SyncResult<()>;

    /// The stored trace with the highest origin block, if any.
    async fn latest_tx_trace(&self) -> SyncResult<Option<TxTrace>>;

    /// The rollup summary record, if initialised.
    async fn store(&self) -> SyncResult<Option<Store>>;

    async fn update_store(&self, store: &Store) -> SyncResult<()>;

    /// Check if storage is available and healthy.
    async fn is_available(&self) -> bool;
}
