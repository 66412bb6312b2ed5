//! Chain models, their JSON-RPC wire shapes, and engine configuration.
//!
//! `Raw*` types mirror what an Ethereum-style node returns (hex quantities as
//! strings). `convert()` turns them into the models the engine computes on and
//! persists.

use crate::utils::{decode_hex, decode_value_hex};
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Block as returned by `eth_getBlockByNumber(height, true)`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RawBlock {
    pub number: String,
    pub timestamp: String,
    pub transactions: Vec<RawTransaction>,
    pub hash: String,
    pub parent_hash: String,
    pub sha3_uncles: String,
    pub miner: String,
    pub difficulty: String,
    pub total_difficulty: String,
    pub size: String,
    pub gas_used: String,
    pub gas_limit: String,
    pub nonce: String,
    pub uncles: Vec<String>,
    pub extra_data: String,
    pub base_fee_per_gas: Option<String>,
}

impl RawBlock {
    pub fn convert(self) -> Block {
        let gas_used = decode_hex(&self.gas_used);
        let base_fee_per_gas = self.base_fee_per_gas.as_deref().map(decode_value_hex);
        let burned = base_fee_per_gas
            .map(|fee| U256::from(gas_used) * fee)
            .unwrap_or(U256::ZERO);

        Block {
            number: decode_hex(&self.number),
            timestamp: decode_hex(&self.timestamp),
            txs: self.transactions.len(),
            transactions: self.transactions,
            token_transfers: 0,
            hash: self.hash,
            parent_hash: self.parent_hash,
            sha3_uncles: self.sha3_uncles,
            miner: self.miner,
            difficulty: decode_value_hex(&self.difficulty),
            total_difficulty: decode_value_hex(&self.total_difficulty),
            size: decode_hex(&self.size),
            gas_used,
            gas_limit: decode_hex(&self.gas_limit),
            nonce: self.nonce,
            uncle_no: self.uncles.len(),
            uncles: self.uncles,
            base_fee_per_gas,
            burned,
            total_burned: U256::ZERO,
            block_reward: U256::ZERO,
            uncle_rewards: U256::ZERO,
            avg_gas_price: U256::ZERO,
            tx_fees: U256::ZERO,
            minted: U256::ZERO,
            supply: U256::ZERO,
            extra_data: self.extra_data,
        }
    }
}

/// A canonical (or forked) block with its computed accounting fields.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    pub timestamp: u64,
    /// Raw transactions still to be processed; never persisted.
    #[serde(skip)]
    pub transactions: Vec<RawTransaction>,
    #[serde(rename = "transactions")]
    pub txs: usize,
    pub token_transfers: usize,
    pub hash: String,
    pub parent_hash: String,
    pub sha3_uncles: String,
    pub miner: String,
    pub difficulty: U256,
    pub total_difficulty: U256,
    pub size: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub nonce: String,
    pub uncles: Vec<String>,
    pub uncle_no: usize,
    pub base_fee_per_gas: Option<U256>,
    pub burned: U256,
    pub total_burned: U256,
    pub block_reward: U256,
    pub uncle_rewards: U256,
    pub avg_gas_price: U256,
    pub tx_fees: U256,
    pub minted: U256,
    pub supply: U256,
    pub extra_data: String,
}

/// Transaction as embedded in a full block.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTransaction {
    pub block_hash: String,
    pub block_number: String,
    pub from: String,
    pub gas: String,
    pub gas_price: String,
    pub hash: String,
    pub input: String,
    pub nonce: String,
    /// `None` for contract creation.
    pub to: Option<String>,
    pub transaction_index: String,
    pub value: String,
}

impl RawTransaction {
    pub fn convert(&self) -> Transaction {
        Transaction {
            block_hash: self.block_hash.clone(),
            block_number: decode_hex(&self.block_number),
            hash: self.hash.clone(),
            timestamp: 0,
            input: self.input.clone(),
            value: decode_value_hex(&self.value),
            gas: decode_hex(&self.gas),
            gas_price: decode_hex(&self.gas_price),
            nonce: self.nonce.clone(),
            transaction_index: decode_hex(&self.transaction_index),
            from: self.from.clone(),
            to: self.to.clone().unwrap_or_default(),
            status: false,
            gas_used: 0,
            contract_address: String::new(),
            logs: Vec::new(),
            base_fee_per_gas: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub block_hash: String,
    pub block_number: u64,
    pub hash: String,
    pub timestamp: u64,
    pub input: String,
    pub value: U256,
    pub gas: u64,
    pub gas_price: u64,
    pub nonce: String,
    pub transaction_index: u64,
    pub from: String,
    pub to: String,
    pub status: bool,
    pub gas_used: u64,
    pub contract_address: String,
    pub logs: Vec<TxLog>,
    pub base_fee_per_gas: Option<U256>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TxLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub transaction_index: String,
    pub transaction_hash: String,
    pub block_hash: String,
    pub log_index: String,
    pub removed: bool,
}

/// Receipt as returned by `eth_getTransactionReceipt`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTxReceipt {
    pub block_hash: String,
    pub block_number: String,
    pub contract_address: Option<String>,
    pub cumulative_gas_used: String,
    pub from: String,
    pub gas_used: String,
    pub logs: Vec<TxLog>,
    pub logs_bloom: String,
    pub status: Option<String>,
    pub to: Option<String>,
    pub transaction_hash: String,
    pub transaction_index: String,
}

impl RawTxReceipt {
    pub fn convert(self) -> TxReceipt {
        TxReceipt {
            block_hash: self.block_hash,
            block_number: decode_hex(&self.block_number),
            contract_address: self.contract_address.unwrap_or_default(),
            cumulative_gas_used: decode_hex(&self.cumulative_gas_used),
            from: self.from,
            gas_used: decode_hex(&self.gas_used),
            logs: self.logs,
            logs_bloom: self.logs_bloom,
            status: self.status.as_deref() == Some("0x1"),
            to: self.to.unwrap_or_default(),
            transaction_hash: self.transaction_hash,
            transaction_index: decode_hex(&self.transaction_index),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub block_hash: String,
    pub block_number: u64,
    pub contract_address: String,
    pub cumulative_gas_used: u64,
    pub from: String,
    pub gas_used: u64,
    pub logs: Vec<TxLog>,
    pub logs_bloom: String,
    pub status: bool,
    pub to: String,
    pub transaction_hash: String,
    pub transaction_index: u64,
}

/// Uncle header as returned by `eth_getUncleByBlockNumberAndIndex`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RawUncle {
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
    pub sha3_uncles: String,
    pub miner: String,
    pub difficulty: String,
    pub gas_used: String,
    pub gas_limit: String,
    pub timestamp: String,
}

impl RawUncle {
    pub fn convert(self) -> Uncle {
        Uncle {
            number: decode_hex(&self.number),
            position: 0,
            block_number: 0,
            hash: self.hash,
            parent_hash: self.parent_hash,
            sha3_uncles: self.sha3_uncles,
            miner: self.miner,
            difficulty: decode_value_hex(&self.difficulty),
            gas_used: decode_hex(&self.gas_used),
            gas_limit: decode_hex(&self.gas_limit),
            timestamp: decode_hex(&self.timestamp),
            reward: U256::ZERO,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Uncle {
    pub number: u64,
    /// Index within the including block's uncle list.
    pub position: u64,
    /// Height of the including block.
    pub block_number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub sha3_uncles: String,
    pub miner: String,
    pub difficulty: U256,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub timestamp: u64,
    pub reward: U256,
}

/// ERC20-style transfer decoded from transaction call-data.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    pub block_number: u64,
    pub hash: String,
    pub timestamp: u64,
    pub from: String,
    pub to: String,
    pub value: U256,
    pub contract: String,
    pub method: String,
    pub status: bool,
    /// Raw call-data, kept only when the input could not be decoded.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

/// Call frame as returned by `debug_traceTransaction` with the call tracer.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTxTrace {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub to: String,
    pub value: Option<String>,
    pub gas: String,
    pub gas_used: String,
    pub input: String,
    pub output: String,
    pub calls: Vec<RawTxTrace>,
}

impl RawTxTrace {
    pub fn convert(self) -> InternalTx {
        InternalTx {
            kind: self.kind,
            from: self.from,
            to: self.to,
            value: self
                .value
                .as_deref()
                .map(decode_value_hex)
                .unwrap_or(U256::ZERO),
            gas: decode_hex(&self.gas),
            gas_used: decode_hex(&self.gas_used),
            input: self.input,
            output: self.output,
            calls: self.calls.into_iter().map(RawTxTrace::convert).collect(),
        }
    }
}

/// One state transition inside a transaction, with its nested calls.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InternalTx {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub to: String,
    pub value: U256,
    pub gas: u64,
    pub gas_used: u64,
    pub input: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<InternalTx>,
}

/// Trace of a transaction, keyed by the transaction and its block.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TxTrace {
    #[serde(rename = "hash")]
    pub origin_tx_hash: String,
    #[serde(rename = "number")]
    pub origin_block_no: u64,
    pub trace: InternalTx,
}

/// Rollup summary record, one per chain.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    pub timestamp: u64,
    pub symbol: String,
    pub supply: U256,
    pub latest_block: u64,
    pub latest_hash: String,
    pub total_transactions: u64,
    pub total_token_transfers: u64,
    pub total_uncles: u64,
}

/// JSON-RPC request structure
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub id: u32,
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<serde_json::Value>,
}

/// JSON-RPC response structure
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcResponse {
    pub id: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
    pub jsonrpc: String,
}

/// JSON-RPC error structure
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Ubiq genesis allocation, in wei.
pub const UBIQ_GENESIS_SUPPLY: &str = "36108073197716300000000000";

/// Settings for the transaction trace pass.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Run a trace pass after each block sync cycle
    pub enabled: bool,
    /// First block whose transactions are traced
    pub start_block: u64,
    /// Blocks per trace pipeline
    pub batch_blocks: u64,
    /// Outstanding trace tasks per batch
    pub max_routines: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_block: 0,
            batch_blocks: 500,
            max_routines: 25,
        }
    }
}

/// Configuration for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Outstanding block tasks per cycle
    pub max_routines: usize,
    /// Upper bound on outstanding transaction tasks within one block
    pub max_tx_routines: usize,
    /// Abort the block when a transaction receipt cannot be fetched
    pub strict_receipts: bool,
    /// Entries kept in the recent-state cache
    pub cache_capacity: usize,
    /// Supply credited to the genesis block on first run
    pub genesis_supply: U256,
    /// Ticker symbol written to the summary record
    pub symbol: String,
    /// Blocks per segment log line
    pub log_batch_blocks: usize,
    /// Maximum time between segment log lines
    pub log_interval: Duration,
    /// Time between sync cycles
    pub interval: Duration,
    pub tracing: TraceConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_routines: (num_cpus::get() * 4).max(8),
            max_tx_routines: 64,
            strict_receipts: true,
            cache_capacity: crate::cache::DEFAULT_CACHE_CAPACITY,
            genesis_supply: U256::from_str_radix(UBIQ_GENESIS_SUPPLY, 10).unwrap_or(U256::ZERO),
            symbol: "UBQ".to_string(),
            log_batch_blocks: 1000,
            log_interval: Duration::from_secs(60),
            interval: Duration::from_secs(5),
            tracing: TraceConfig::default(),
        }
    }
}
