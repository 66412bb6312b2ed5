//! Production adapters: a JSON-RPC node client and RocksDB-backed storage.

use async_trait::async_trait;
use log::{debug, error};
use rand::Rng;
use rocksdb::{Direction, IteratorMode, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spectrum_sync::utils::{decode_hex, encode_quantity};
use spectrum_sync::{
    Block, InternalTx, JsonRpcRequest, JsonRpcResponse, NodeAdapter, RawBlock, RawTxReceipt,
    RawTxTrace, RawUncle, StorageAdapter, Store, SyncError, SyncResult, TokenTransfer,
    Transaction, TxReceipt, TxTrace, Uncle,
};

/// Node adapter speaking Ethereum JSON-RPC over HTTP.
#[derive(Clone)]
pub struct JsonRpcNodeAdapter {
    rpc_url: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
    next_id: Arc<AtomicU32>,
}

impl JsonRpcNodeAdapter {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("couldn't build HTTP client: {}", e)))?;

        Ok(Self {
            rpc_url: rpc_url.into(),
            client,
            max_retries: 5,
            retry_delay: Duration::from_millis(500),
            next_id: Arc::new(AtomicU32::new(1)),
        })
    }

    /// Override the retry budget for transport failures.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    async fn post(&self, request: &JsonRpcRequest) -> SyncResult<JsonRpcResponse> {
        let mut retry_delay = self.retry_delay;
        let max_delay = Duration::from_secs(16);
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            let sent = self
                .client
                .post(&self.rpc_url)
                .json(request)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match sent {
                Ok(response) => {
                    return response.json::<JsonRpcResponse>().await.map_err(|e| {
                        SyncError::Node(format!("JSON parsing error for {}: {}", request.method, e))
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 == self.max_retries {
                        break;
                    }

                    let jitter = rand::thread_rng().gen_range(0..=100) as u64;
                    retry_delay = std::cmp::min(
                        max_delay,
                        retry_delay * 2 + Duration::from_millis(jitter),
                    );
                    debug!(
                        "Request {} failed (attempt {}): {}, retrying in {:?}",
                        request.method,
                        attempt + 1,
                        e,
                        retry_delay
                    );
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }

        error!("{} failed after {} attempts", request.method, self.max_retries);
        Err(SyncError::Node(format!(
            "RPC request {} failed: {}",
            request.method, last_error
        )))
    }

    /// Call `method` and return its non-null result.
    async fn call(&self, method: &str, params: Vec<Value>) -> SyncResult<Value> {
        let request = JsonRpcRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };

        let response = self.post(&request).await?;
        if let Some(err) = response.error {
            return Err(SyncError::Node(format!(
                "{} returned error {}: {}",
                method, err.code, err.message
            )));
        }

        match response.result {
            Some(Value::Null) | None => Err(SyncError::Node(format!(
                "{} returned no result for {:?}",
                method, request.params
            ))),
            Some(result) => Ok(result),
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> SyncResult<T> {
        let result = self.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait]
impl NodeAdapter for JsonRpcNodeAdapter {
    async fn latest_block_number(&self) -> SyncResult<u64> {
        let number: String = self.call_as("eth_blockNumber", vec![]).await?;
        Ok(decode_hex(&number))
    }

    async fn get_block_by_height(&self, height: u64) -> SyncResult<Block> {
        let raw: RawBlock = self
            .call_as(
                "eth_getBlockByNumber",
                vec![Value::String(encode_quantity(height)), Value::Bool(true)],
            )
            .await?;
        Ok(raw.convert())
    }

    async fn get_uncles_in_block(&self, hashes: &[String], height: u64) -> SyncResult<Vec<Uncle>> {
        let mut uncles = Vec::with_capacity(hashes.len());
        for index in 0..hashes.len() {
            let raw: RawUncle = self
                .call_as(
                    "eth_getUncleByBlockNumberAndIndex",
                    vec![
                        Value::String(encode_quantity(height)),
                        Value::String(encode_quantity(index as u64)),
                    ],
                )
                .await?;
            let mut uncle = raw.convert();
            uncle.position = index as u64;
            uncles.push(uncle);
        }
        Ok(uncles)
    }

    async fn get_tx_receipt(&self, hash: &str) -> SyncResult<TxReceipt> {
        let raw: RawTxReceipt = self
            .call_as(
                "eth_getTransactionReceipt",
                vec![Value::String(hash.to_string())],
            )
            .await?;
        Ok(raw.convert())
    }

    async fn trace_transaction(&self, hash: &str) -> SyncResult<InternalTx> {
        let raw: RawTxTrace = self
            .call_as(
                "debug_traceTransaction",
                vec![
                    Value::String(hash.to_string()),
                    serde_json::json!({ "tracer": "callTracer" }),
                ],
            )
            .await?;
        Ok(raw.convert())
    }

    async fn is_connected(&self) -> bool {
        match self.call("web3_clientVersion", vec![]).await {
            Ok(version) => {
                debug!("connected to node {}", version);
                true
            }
            Err(e) => {
                debug!("node ping failed: {}", e);
                false
            }
        }
    }
}

const BLOCK_PREFIX: &str = "block/";
const BLOCK_HASH_PREFIX: &str = "block_hash/";
const FORKED_PREFIX: &str = "forked/";
const TX_PREFIX: &str = "tx/";
const TX_BY_BLOCK_PREFIX: &str = "tx_by_block/";
const TRACE_PREFIX: &str = "trace/";
const CONTRACT_PREFIX: &str = "contract/";
const CONTRACT_CALL_PREFIX: &str = "contract_call/";
const TRANSFER_PREFIX: &str = "transfer/";
const UNCLE_PREFIX: &str = "uncle/";
const STORE_KEY: &[u8] = b"__INTERNAL/store";

fn block_key(number: u64) -> Vec<u8> {
    format!("{}{:020}", BLOCK_PREFIX, number).into_bytes()
}

fn forked_prefix(number: u64) -> String {
    format!("{}{:020}/", FORKED_PREFIX, number)
}

/// Index prefix for the transactions of block `number` with hash `block_hash`.
fn tx_by_block_prefix(number: u64, block_hash: &str) -> String {
    format!("{}{:020}/{}/", TX_BY_BLOCK_PREFIX, number, block_hash)
}

fn trace_key(trace: &TxTrace) -> Vec<u8> {
    format!(
        "{}{:020}/{}",
        TRACE_PREFIX, trace.origin_block_no, trace.origin_tx_hash
    )
    .into_bytes()
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Storage(format!("{}: {}", context, e))
}

/// Storage adapter keeping JSON records in a single RocksDB keyspace.
///
/// Keys are `<collection>/<id>`; block numbers are zero-padded so that
/// lexicographic order is height order. Re-inserting a record overwrites it.
#[derive(Clone)]
pub struct RocksDBStorageAdapter {
    db: Arc<DB>,
}

impl RocksDBStorageAdapter {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    /// Value of the highest key under `prefix`, which must end in '/'.
    fn last_under<T: DeserializeOwned>(&self, prefix: &str) -> SyncResult<Option<T>> {
        // '0' sorts right after '/', so this lands on the last key of the prefix.
        let upper = format!("{}0", prefix.trim_end_matches('/'));
        let mut iter = self
            .db
            .iterator(IteratorMode::From(upper.as_bytes(), Direction::Reverse));

        match iter.next() {
            Some(Ok((key, value))) if key.starts_with(prefix.as_bytes()) => {
                Ok(Some(serde_json::from_slice(&value)?))
            }
            Some(Err(e)) => Err(storage_err("Failed to scan records", e)),
            _ => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> SyncResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db
            .put(key, bytes)
            .map_err(|e| storage_err("Failed to write record", e))
    }

    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> SyncResult<Option<T>> {
        match self
            .db
            .get(key)
            .map_err(|e| storage_err("Failed to read record", e))?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StorageAdapter for RocksDBStorageAdapter {
    async fn latest_block(&self) -> SyncResult<Option<Block>> {
        self.last_under(BLOCK_PREFIX)
    }

    async fn block_by_number(&self, number: u64) -> SyncResult<Option<Block>> {
        self.get_json(&block_key(number))
    }

    async fn block_by_hash(&self, hash: &str) -> SyncResult<Option<Block>> {
        let index_key = format!("{}{}", BLOCK_HASH_PREFIX, hash);
        match self.get_json::<u64>(index_key.as_bytes())? {
            Some(number) => self.block_by_number(number).await,
            None => Ok(None),
        }
    }

    async fn add_block(&self, block: &Block) -> SyncResult<()> {
        let mut batch = WriteBatch::default();
        batch.put(block_key(block.number), serde_json::to_vec(block)?);
        batch.put(
            format!("{}{}", BLOCK_HASH_PREFIX, block.hash),
            serde_json::to_vec(&block.number)?,
        );
        self.db
            .write(batch)
            .map_err(|e| storage_err("Failed to write block", e))
    }

    async fn add_forked_block(&self, block: &Block) -> SyncResult<()> {
        let key = format!("{}{}", forked_prefix(block.number), block.hash);
        self.put_json(key.as_bytes(), block)
    }

    async fn forked_blocks(&self, number: u64) -> SyncResult<Vec<Block>> {
        let prefix = forked_prefix(number);
        let mut blocks = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, value) = item.map_err(|e| storage_err("Failed to scan forked blocks", e))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            blocks.push(serde_json::from_slice(&value)?);
        }
        Ok(blocks)
    }

    async fn purge_block(&self, number: u64) -> SyncResult<()> {
        let mut batch = WriteBatch::default();
        if let Some(block) = self.block_by_number(number).await? {
            batch.delete(format!("{}{}", BLOCK_HASH_PREFIX, block.hash));
        }
        batch.delete(block_key(number));
        self.db
            .write(batch)
            .map_err(|e| storage_err("Failed to purge block", e))
    }

    async fn add_transaction(&self, tx: &Transaction) -> SyncResult<()> {
        let index_key = format!(
            "{}{:010}",
            tx_by_block_prefix(tx.block_number, &tx.block_hash),
            tx.transaction_index
        );
        let mut batch = WriteBatch::default();
        batch.put(format!("{}{}", TX_PREFIX, tx.hash), serde_json::to_vec(tx)?);
        batch.put(index_key, serde_json::to_vec(&tx.hash)?);
        self.db
            .write(batch)
            .map_err(|e| storage_err("Failed to write transaction", e))
    }

    async fn add_deployed_contract(&self, tx: &Transaction) -> SyncResult<()> {
        self.put_json(format!("{}{}", CONTRACT_PREFIX, tx.hash).as_bytes(), tx)
    }

    async fn add_contract_call(&self, tx: &Transaction) -> SyncResult<()> {
        self.put_json(format!("{}{}", CONTRACT_CALL_PREFIX, tx.hash).as_bytes(), tx)
    }

    async fn add_token_transfer(&self, transfer: &TokenTransfer) -> SyncResult<()> {
        self.put_json(
            format!("{}{}", TRANSFER_PREFIX, transfer.hash).as_bytes(),
            transfer,
        )
    }

    async fn add_uncle(&self, uncle: &Uncle) -> SyncResult<()> {
        self.put_json(format!("{}{}", UNCLE_PREFIX, uncle.hash).as_bytes(), uncle)
    }

    async fn canonical_tx_hashes(&self, from: u64, to: u64) -> SyncResult<Vec<(u64, String)>> {
        let mut hashes = Vec::new();
        for number in from..=to {
            let Some(block) = self.block_by_number(number).await? else {
                continue;
            };
            let prefix = tx_by_block_prefix(number, &block.hash);
            for item in self
                .db
                .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
            {
                let (key, value) =
                    item.map_err(|e| storage_err("Failed to scan block transactions", e))?;
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                hashes.push((number, serde_json::from_slice(&value)?));
            }
        }
        Ok(hashes)
    }

    async fn add_tx_traces(&self, traces: &[TxTrace]) -> SyncResult<()> {
        let mut batch = WriteBatch::default();
        for trace in traces {
            batch.put(trace_key(trace), serde_json::to_vec(trace)?);
        }
        self.db
            .write(batch)
            .map_err(|e| storage_err("Failed to write traces", e))
    }

    async fn latest_tx_trace(&self) -> SyncResult<Option<TxTrace>> {
        self.last_under(TRACE_PREFIX)
    }

    async fn store(&self) -> SyncResult<Option<Store>> {
        self.get_json(STORE_KEY)
    }

    async fn update_store(&self, store: &Store) -> SyncResult<()> {
        self.put_json(STORE_KEY, store)
    }

    async fn is_available(&self) -> bool {
        self.db.get(STORE_KEY).is_ok()
    }
}

impl RocksDBStorageAdapter {
    /// Look up a stored transaction by hash.
    pub fn transaction(&self, hash: &str) -> SyncResult<Option<Transaction>> {
        self.get_json(format!("{}{}", TX_PREFIX, hash).as_bytes())
    }

    /// Look up a stored token transfer by its transaction hash.
    pub fn token_transfer(&self, hash: &str) -> SyncResult<Option<TokenTransfer>> {
        self.get_json(format!("{}{}", TRANSFER_PREFIX, hash).as_bytes())
    }

    /// Look up a stored uncle by hash.
    pub fn uncle(&self, hash: &str) -> SyncResult<Option<Uncle>> {
        self.get_json(format!("{}{}", UNCLE_PREFIX, hash).as_bytes())
    }
}
