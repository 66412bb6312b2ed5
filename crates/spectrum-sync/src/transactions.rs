//! Per-block transaction fan-out.
//!
//! Every transaction of a block becomes one pipeline task that fetches its
//! receipt concurrently and, in submission order, merges the receipt, updates
//! the block's fee totals and persists the transaction. Token transfers get a
//! second task chained right behind their transaction; it runs after the
//! transaction's ordered phase and so sees the receipt status.

use crate::synchronizer::Synchronizer;
use crate::utils::{decode_value_hex, input_param_to_address, ZERO_ADDRESS};
use crate::{Block, NodeAdapter, StorageAdapter, TokenTransfer, Transaction};
use alloy_primitives::U256;
use log::{debug, error, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const TRANSFER_SELECTOR: &str = "0xa9059cbb";
pub const TRANSFER_FROM_SELECTOR: &str = "0x23b872dd";
pub const SWEEP_SELECTOR: &str = "0x6ea056a9";
pub const MINT_SELECTOR: &str = "0x40c10f19";

/// Hex chars in `0x` + selector + two ABI words.
const TWO_PARAM_INPUT_LEN: usize = 138;
/// Hex chars in `0x` + selector + three ABI words.
const THREE_PARAM_INPUT_LEN: usize = 202;

fn selector(input: &str) -> Option<&str> {
    input.get(..10)
}

pub fn is_token_transfer(tx: &Transaction) -> bool {
    matches!(
        selector(&tx.input),
        Some(TRANSFER_SELECTOR | TRANSFER_FROM_SELECTOR | SWEEP_SELECTOR | MINT_SELECTOR)
    )
}

pub fn is_contract_deploy(tx: &Transaction) -> bool {
    !tx.contract_address.is_empty()
}

/// A call into a contract that is neither a deployment nor a token transfer.
pub fn is_contract_call(tx: &Transaction) -> bool {
    !is_token_transfer(tx) && tx.contract_address.is_empty() && tx.input != "0x"
}

fn abi_words(input: &str) -> Option<Vec<&str>> {
    match input.len() {
        TWO_PARAM_INPUT_LEN => Some(vec![input.get(10..74)?, input.get(74..)?]),
        THREE_PARAM_INPUT_LEN => Some(vec![
            input.get(10..74)?,
            input.get(74..138)?,
            input.get(138..)?,
        ]),
        _ => None,
    }
}

/// Decode the token transfer carried in a transaction's call-data.
///
/// Inputs of non-standard length, or with an unrecognised selector, produce a
/// record with method `unknown` that carries the raw input.
pub fn decode_token_transfer(tx: &Transaction) -> TokenTransfer {
    let mut transfer = TokenTransfer {
        block_number: tx.block_number,
        hash: tx.hash.clone(),
        timestamp: tx.timestamp,
        ..Default::default()
    };

    let (method, params) = match (selector(&tx.input), abi_words(&tx.input)) {
        (Some(method), Some(params)) => (method, params),
        _ => {
            error!(
                "couldn't process token transfer {}: input length {} is not standard",
                tx.hash,
                tx.input.len()
            );
            transfer.method = "unknown".to_string();
            transfer.data = tx.input.clone();
            return transfer;
        }
    };

    match (method, params.as_slice()) {
        (TRANSFER_SELECTOR, [to, value, ..]) => {
            transfer.from = tx.from.clone();
            transfer.to = input_param_to_address(to);
            transfer.value = decode_value_hex(value);
            transfer.contract = tx.to.clone();
            transfer.method = "transfer".to_string();
        }
        (TRANSFER_FROM_SELECTOR, [from, to, value]) => {
            transfer.from = input_param_to_address(from);
            transfer.to = input_param_to_address(to);
            transfer.value = decode_value_hex(value);
            transfer.contract = tx.to.clone();
            transfer.method = "transferFrom".to_string();
        }
        (SWEEP_SELECTOR, [token, value, ..]) => {
            transfer.from = tx.to.clone();
            transfer.to = tx.from.clone();
            transfer.value = decode_value_hex(value);
            transfer.contract = input_param_to_address(token);
            transfer.method = "sweep".to_string();
        }
        (MINT_SELECTOR, [to, value, ..]) => {
            transfer.from = ZERO_ADDRESS.to_string();
            transfer.to = input_param_to_address(to);
            transfer.value = decode_value_hex(value);
            transfer.contract = tx.to.clone();
            transfer.method = "mint".to_string();
        }
        _ => {
            warn!(
                "unrecognised token transfer layout in {} (selector {})",
                tx.hash, method
            );
            transfer.method = "unknown".to_string();
            transfer.data = tx.input.clone();
        }
    }

    transfer
}

/// Totals merged from transaction ordered phases.
#[derive(Debug, Default)]
struct TxAccumulator {
    gas_price: U256,
    tx_fees: U256,
    token_transfers: u64,
    contracts_deployed: u64,
    contract_calls: u64,
}

/// Result of fanning out one block's transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxSummary {
    pub avg_gas_price: U256,
    pub tx_fees: U256,
    pub token_transfers: u64,
    pub contracts_deployed: u64,
    pub contract_calls: u64,
    /// A receipt fetch failed in strict mode; the totals are incomplete.
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FanoutConfig {
    pub max_routines: usize,
    pub strict_receipts: bool,
}

/// Outstanding transaction tasks for a block with `tx_count` transactions.
pub fn fanout_concurrency(tx_count: usize, cap: usize) -> usize {
    (tx_count * 2).min(cap).max(1)
}

/// Fetch receipts for, classify, and persist every transaction in `block`.
///
/// Returns once every transaction task has finished.
pub async fn process_transactions<N, S>(
    node: Arc<N>,
    storage: Arc<S>,
    block: &Block,
    config: FanoutConfig,
) -> TxSummary
where
    N: NodeAdapter + 'static,
    S: StorageAdapter + 'static,
{
    let tx_count = block.transactions.len();
    if tx_count == 0 {
        return TxSummary::default();
    }

    let accumulator = Arc::new(Mutex::new(TxAccumulator::default()));
    let pipeline = Synchronizer::new(fanout_concurrency(tx_count, config.max_routines));
    debug!(
        "processing {} transactions of block {} over {} routines",
        tx_count,
        block.number,
        pipeline.max_concurrent()
    );

    for (index, raw) in block.transactions.iter().enumerate() {
        let mut tx = raw.convert();
        // A token transfer inherits these, so set them before sharing.
        tx.block_number = block.number;
        tx.block_hash = block.hash.clone();
        tx.transaction_index = index as u64;
        tx.timestamp = block.timestamp;
        tx.base_fee_per_gas = block.base_fee_per_gas;

        let token_transfer = is_token_transfer(&tx);
        let shared = Arc::new(Mutex::new(tx));

        let admitted = {
            let node = node.clone();
            let storage = storage.clone();
            let accumulator = accumulator.clone();
            let shared = shared.clone();
            pipeline
                .add_link(move |mut task| async move {
                    let hash = shared.lock().await.hash.clone();
                    let receipt = match node.get_tx_receipt(&hash).await {
                        Ok(receipt) => Some(receipt),
                        Err(e) => {
                            error!("couldn't get tx receipt {}: {}", hash, e);
                            if config.strict_receipts {
                                task.abort();
                                return;
                            }
                            None
                        }
                    };

                    if task.wait().await {
                        return;
                    }

                    let receipt = receipt.unwrap_or_default();
                    let tx = {
                        let mut tx = shared.lock().await;
                        tx.gas_used = receipt.gas_used;
                        tx.contract_address = receipt.contract_address;
                        tx.logs = receipt.logs;
                        tx.status = receipt.status;
                        tx.clone()
                    };

                    commit_transaction(storage.as_ref(), &tx, &accumulator).await;
                })
                .await
        };

        if !admitted {
            break;
        }

        if token_transfer {
            accumulator.lock().await.token_transfers += 1;

            let storage = storage.clone();
            let admitted = pipeline
                .add_link(move |mut task| async move {
                    if task.wait().await {
                        return;
                    }

                    // Status is only known once the transaction's ordered phase ran.
                    let transfer = {
                        let tx = shared.lock().await;
                        let mut transfer = decode_token_transfer(&tx);
                        transfer.status = tx.status;
                        transfer
                    };
                    if let Err(e) = storage.add_token_transfer(&transfer).await {
                        error!("couldn't insert token transfer {}: {}", transfer.hash, e);
                    }
                })
                .await;

            if !admitted {
                break;
            }
        }
    }

    let aborted = pipeline.finish().await;
    if aborted {
        debug!("transaction pipeline for block {} aborted", block.number);
    }

    let acc = accumulator.lock().await;
    TxSummary {
        avg_gas_price: acc.gas_price / U256::from(tx_count),
        tx_fees: acc.tx_fees,
        token_transfers: acc.token_transfers,
        contracts_deployed: acc.contracts_deployed,
        contract_calls: acc.contract_calls,
        aborted,
    }
}

async fn commit_transaction<S: StorageAdapter>(
    storage: &S,
    tx: &Transaction,
    accumulator: &Mutex<TxAccumulator>,
) {
    let gas_price = U256::from(tx.gas_price);
    let deploy = is_contract_deploy(tx);
    let call = is_contract_call(tx);

    {
        let mut acc = accumulator.lock().await;
        acc.gas_price += gas_price;
        acc.tx_fees += gas_price * U256::from(tx.gas_used);
        if deploy {
            acc.contracts_deployed += 1;
        }
        if call {
            acc.contract_calls += 1;
        }
    }

    if let Err(e) = storage.add_transaction(tx).await {
        error!("couldn't insert tx {}: {}", tx.hash, e);
    }

    if deploy {
        if let Err(e) = storage.add_deployed_contract(tx).await {
            error!("couldn't insert deployed contract {}: {}", tx.hash, e);
        }
    }

    if call {
        if let Err(e) = storage.add_contract_call(tx).await {
            error!("couldn't insert contract call {}: {}", tx.hash, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockNode, MockStorage};
    use crate::{RawTransaction, TxReceipt};

    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x2222222222222222222222222222222222222222";
    const TOKEN: &str = "0x3333333333333333333333333333333333333333";

    fn word_address(addr: &str) -> String {
        format!("{:0>64}", addr.trim_start_matches("0x"))
    }

    fn word_value(value: u64) -> String {
        format!("{:064x}", value)
    }

    fn tx_with_input(input: String) -> Transaction {
        Transaction {
            hash: "0xabc".to_string(),
            block_number: 42,
            timestamp: 1_600_000_000,
            from: ALICE.to_string(),
            to: TOKEN.to_string(),
            input,
            ..Default::default()
        }
    }

    #[test]
    fn test_classification() {
        let plain = tx_with_input("0x".to_string());
        assert!(!is_token_transfer(&plain));
        assert!(!is_contract_call(&plain));
        assert!(!is_contract_deploy(&plain));

        let transfer = tx_with_input(format!("{}{}", TRANSFER_SELECTOR, word_value(1)));
        assert!(is_token_transfer(&transfer));
        assert!(!is_contract_call(&transfer));

        let call = tx_with_input("0xdeadbeef".to_string());
        assert!(is_contract_call(&call));

        let mut deploy = tx_with_input("0x6060".to_string());
        deploy.contract_address = TOKEN.to_string();
        assert!(is_contract_deploy(&deploy));
        assert!(!is_contract_call(&deploy));
    }

    #[test]
    fn test_decode_transfer() {
        let input = format!("{}{}{}", TRANSFER_SELECTOR, word_address(BOB), word_value(500));
        assert_eq!(input.len(), 138);
        let transfer = decode_token_transfer(&tx_with_input(input));

        assert_eq!(transfer.method, "transfer");
        assert_eq!(transfer.from, ALICE);
        assert_eq!(transfer.to, BOB);
        assert_eq!(transfer.contract, TOKEN);
        assert_eq!(transfer.value, U256::from(500u64));
        assert_eq!(transfer.block_number, 42);
        assert!(transfer.data.is_empty());
    }

    #[test]
    fn test_decode_transfer_from() {
        let input = format!(
            "{}{}{}{}",
            TRANSFER_FROM_SELECTOR,
            word_address(BOB),
            word_address(ALICE),
            word_value(7)
        );
        assert_eq!(input.len(), 202);
        let transfer = decode_token_transfer(&tx_with_input(input));

        assert_eq!(transfer.method, "transferFrom");
        assert_eq!(transfer.from, BOB);
        assert_eq!(transfer.to, ALICE);
        assert_eq!(transfer.value, U256::from(7u64));
    }

    #[test]
    fn test_decode_sweep_and_mint() {
        let other = "0x4444444444444444444444444444444444444444";
        let sweep = decode_token_transfer(&tx_with_input(format!(
            "{}{}{}",
            SWEEP_SELECTOR,
            word_address(other),
            word_value(9)
        )));
        assert_eq!(sweep.method, "sweep");
        assert_eq!(sweep.from, TOKEN);
        assert_eq!(sweep.to, ALICE);
        assert_eq!(sweep.contract, other);

        let mint = decode_token_transfer(&tx_with_input(format!(
            "{}{}{}",
            MINT_SELECTOR,
            word_address(BOB),
            word_value(3)
        )));
        assert_eq!(mint.method, "mint");
        assert_eq!(mint.from, ZERO_ADDRESS);
        assert_eq!(mint.to, BOB);
        assert_eq!(mint.contract, TOKEN);
    }

    #[test]
    fn test_decode_non_standard_length() {
        let input = format!("{}{}", TRANSFER_SELECTOR, word_value(1));
        let transfer = decode_token_transfer(&tx_with_input(input.clone()));
        assert_eq!(transfer.method, "unknown");
        assert_eq!(transfer.data, input);
        assert_eq!(transfer.hash, "0xabc");
    }

    #[test]
    fn test_fanout_concurrency() {
        assert_eq!(fanout_concurrency(3, 64), 6);
        assert_eq!(fanout_concurrency(1000, 64), 64);
        assert_eq!(fanout_concurrency(0, 64), 1);
    }

    fn raw_tx(hash: &str, gas_price: u64, input: String) -> RawTransaction {
        RawTransaction {
            hash: hash.to_string(),
            from: ALICE.to_string(),
            to: Some(TOKEN.to_string()),
            gas_price: format!("{:#x}", gas_price),
            input,
            ..Default::default()
        }
    }

    fn receipt(status: bool, gas_used: u64, contract_address: &str) -> TxReceipt {
        TxReceipt {
            status,
            gas_used,
            contract_address: contract_address.to_string(),
            ..Default::default()
        }
    }

    fn block_with(txs: Vec<RawTransaction>) -> Block {
        Block {
            number: 42,
            timestamp: 1_600_000_000,
            txs: txs.len(),
            transactions: txs,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_process_transactions_totals() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());

        let transfer_input = format!("{}{}{}", TRANSFER_SELECTOR, word_address(BOB), word_value(5));
        let block = block_with(vec![
            raw_tx("0x01", 10, "0x".to_string()),
            raw_tx("0x02", 20, transfer_input),
            raw_tx("0x03", 30, "0x6060".to_string()),
            raw_tx("0x04", 40, "0xdeadbeef".to_string()),
        ]);
        node.add_receipt("0x01", receipt(true, 21_000, ""));
        node.add_receipt("0x02", receipt(false, 50_000, ""));
        node.add_receipt("0x03", receipt(true, 100_000, TOKEN));
        node.add_receipt("0x04", receipt(true, 30_000, ""));

        let summary = process_transactions(
            node,
            storage.clone(),
            &block,
            FanoutConfig {
                max_routines: 64,
                strict_receipts: true,
            },
        )
        .await;

        assert!(!summary.aborted);
        assert_eq!(summary.avg_gas_price, U256::from(25u64));
        let fees = 10 * 21_000 + 20 * 50_000 + 30 * 100_000 + 40 * 30_000u64;
        assert_eq!(summary.tx_fees, U256::from(fees));
        assert_eq!(summary.token_transfers, 1);
        assert_eq!(summary.contracts_deployed, 1);
        assert_eq!(summary.contract_calls, 1);

        assert_eq!(storage.transactions().len(), 4);
        assert_eq!(storage.deployed_contracts().len(), 1);
        assert_eq!(storage.contract_calls().len(), 1);

        let transfers = storage.token_transfers();
        assert_eq!(transfers.len(), 1);
        // Status comes from the failed receipt of the carrying transaction.
        assert!(!transfers[0].status);
        assert_eq!(transfers[0].timestamp, 1_600_000_000);
        assert_eq!(transfers[0].block_number, 42);

        let stored = storage.transactions();
        let third = stored.iter().find(|tx| tx.hash == "0x03").unwrap();
        assert_eq!(third.block_number, 42);
        assert_eq!(third.transaction_index, 2);
    }

    #[tokio::test]
    async fn test_missing_receipt_strict_aborts() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        let block = block_with(vec![raw_tx("0x01", 10, "0x".to_string())]);

        let summary = process_transactions(
            node,
            storage.clone(),
            &block,
            FanoutConfig {
                max_routines: 8,
                strict_receipts: true,
            },
        )
        .await;

        assert!(summary.aborted);
        assert!(storage.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_receipt_best_effort_zero_fills() {
        let node = Arc::new(MockNode::new());
        let storage = Arc::new(MockStorage::new());
        let block = block_with(vec![raw_tx("0x01", 10, "0x".to_string())]);

        let summary = process_transactions(
            node,
            storage.clone(),
            &block,
            FanoutConfig {
                max_routines: 8,
                strict_receipts: false,
            },
        )
        .await;

        assert!(!summary.aborted);
        assert_eq!(summary.tx_fees, U256::ZERO);
        assert_eq!(summary.avg_gas_price, U256::from(10u64));
        let stored = storage.transactions();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].status);
        assert_eq!(stored[0].gas_used, 0);
    }
}
