//! Block builder utilities for creating linked test chains
//!
//! Blocks are fabricated directly in their converted form, with uncles,
//! transaction receipts and call traces kept alongside so a [`MockNode`] can
//! serve them.

use alloy_primitives::U256;
use spectrum_sync::mock::MockNode;
use spectrum_sync::{Block, InternalTx, RawTransaction, TxReceipt, Uncle};

/// Hash for block `number` on the branch named `tag`.
pub fn block_hash(tag: &str, number: u64) -> String {
    format!("0x{}{:08x}", tag, number)
}

/// A block plus everything the node serves for it.
#[derive(Debug, Clone, Default)]
pub struct ChainBlock {
    pub block: Block,
    pub uncles: Vec<Uncle>,
    pub receipts: Vec<(String, TxReceipt)>,
    pub traces: Vec<(String, InternalTx)>,
}

/// A builder for a single test block
pub struct BlockBuilder {
    number: u64,
    tag: String,
    parent_hash: String,
    timestamp: u64,
    base_fee: Option<U256>,
    gas_used: u64,
    uncles: Vec<Uncle>,
    transactions: Vec<RawTransaction>,
    receipts: Vec<(String, TxReceipt)>,
    traces: Vec<(String, InternalTx)>,
}

impl BlockBuilder {
    pub fn new(tag: &str) -> Self {
        Self {
            number: 0,
            tag: tag.to_string(),
            parent_hash: String::new(),
            timestamp: 1485633600,
            base_fee: None,
            gas_used: 0,
            uncles: Vec::new(),
            transactions: Vec::new(),
            receipts: Vec::new(),
            traces: Vec::new(),
        }
    }

    /// Set the block height. Timestamps advance 88 seconds per block.
    pub fn height(mut self, number: u64) -> Self {
        self.number = number;
        self.timestamp = 1485633600 + number * 88;
        self
    }

    pub fn parent_hash(mut self, parent_hash: impl Into<String>) -> Self {
        self.parent_hash = parent_hash.into();
        self
    }

    pub fn base_fee(mut self, base_fee: u64, gas_used: u64) -> Self {
        self.base_fee = Some(U256::from(base_fee));
        self.gas_used = gas_used;
        self
    }

    /// Add an uncle mined at `uncle_number`.
    pub fn add_uncle(mut self, uncle_number: u64) -> Self {
        let position = self.uncles.len() as u64;
        self.uncles.push(Uncle {
            number: uncle_number,
            hash: format!("0xuncle{:08x}{:02x}", self.number, position),
            parent_hash: block_hash(&self.tag, uncle_number.saturating_sub(1)),
            ..Default::default()
        });
        self
    }

    /// Add a transaction together with the receipt the node returns for it.
    pub fn add_transaction(mut self, tx: RawTransaction, receipt: TxReceipt) -> Self {
        self.receipts.push((tx.hash.clone(), receipt));
        self.transactions.push(tx);
        self
    }

    /// Add a transaction with a receipt and a single-frame call trace.
    pub fn add_traced_transaction(mut self, tx: RawTransaction, receipt: TxReceipt) -> Self {
        let trace = InternalTx {
            kind: "CALL".to_string(),
            from: tx.from.clone(),
            to: tx.to.clone().unwrap_or_default(),
            gas_used: receipt.gas_used,
            input: tx.input.clone(),
            output: "0x".to_string(),
            ..Default::default()
        };
        self.traces.push((tx.hash.clone(), trace));
        self.add_transaction(tx, receipt)
    }

    /// Add a transaction the node has no receipt for.
    pub fn add_transaction_without_receipt(mut self, tx: RawTransaction) -> Self {
        self.transactions.push(tx);
        self
    }

    pub fn build(self) -> ChainBlock {
        let hash = block_hash(&self.tag, self.number);
        let burned = self
            .base_fee
            .map(|fee| fee * U256::from(self.gas_used))
            .unwrap_or(U256::ZERO);

        let block = Block {
            number: self.number,
            timestamp: self.timestamp,
            txs: self.transactions.len(),
            transactions: self.transactions,
            hash,
            parent_hash: self.parent_hash,
            gas_used: self.gas_used,
            gas_limit: 8_000_000,
            uncles: self.uncles.iter().map(|u| u.hash.clone()).collect(),
            uncle_no: self.uncles.len(),
            base_fee_per_gas: self.base_fee,
            burned,
            ..Default::default()
        };

        ChainBlock {
            block,
            uncles: self.uncles,
            receipts: self.receipts,
            traces: self.traces,
        }
    }
}

/// Builds a linked chain starting at genesis
pub struct ChainBuilder {
    tag: String,
    blocks: Vec<ChainBlock>,
}

impl ChainBuilder {
    /// Create a new chain holding only genesis.
    pub fn new(tag: &str) -> Self {
        let genesis = BlockBuilder::new(tag).height(0).build();
        Self {
            tag: tag.to_string(),
            blocks: vec![genesis],
        }
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn tip_hash(&self) -> String {
        self.blocks
            .last()
            .map(|b| b.block.hash.clone())
            .unwrap_or_default()
    }

    fn next(&self, tag: &str) -> BlockBuilder {
        BlockBuilder::new(tag)
            .height(self.height() + 1)
            .parent_hash(self.tip_hash())
    }

    pub fn add_block(mut self) -> Self {
        let block = self.next(&self.tag).build();
        self.blocks.push(block);
        self
    }

    pub fn add_blocks(mut self, count: u64) -> Self {
        for _ in 0..count {
            self = self.add_block();
        }
        self
    }

    pub fn add_custom_block<F>(mut self, builder_fn: F) -> Self
    where
        F: FnOnce(BlockBuilder) -> BlockBuilder,
    {
        let block = builder_fn(self.next(&self.tag)).build();
        self.blocks.push(block);
        self
    }

    /// Branch off below `height`: keeps blocks `0..height` and names new
    /// blocks after `tag`.
    pub fn fork_at(&self, height: u64, tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            blocks: self.blocks.iter().take(height as usize).cloned().collect(),
        }
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.iter().map(|b| b.block.clone()).collect()
    }

    pub fn block(&self, number: u64) -> Option<&Block> {
        self.blocks.get(number as usize).map(|b| &b.block)
    }

    /// Load every block, uncle set and receipt into `node`.
    pub fn seed(&self, node: &MockNode) {
        for chain_block in &self.blocks {
            self.seed_block(node, chain_block);
        }
    }

    /// Load blocks from `from` upward, replacing whatever the node held there.
    pub fn seed_from(&self, node: &MockNode, from: u64) {
        for chain_block in self.blocks.iter().skip(from as usize) {
            self.seed_block(node, chain_block);
        }
    }

    fn seed_block(&self, node: &MockNode, chain_block: &ChainBlock) {
        let number = chain_block.block.number;
        node.add_block(chain_block.block.clone());
        if !chain_block.uncles.is_empty() {
            node.add_uncles(number, chain_block.uncles.clone());
        }
        for (hash, receipt) in &chain_block.receipts {
            node.add_receipt(hash, receipt.clone());
        }
        for (hash, trace) in &chain_block.traces {
            node.add_trace(hash, trace.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_builder_links_parents() {
        let chain = ChainBuilder::new("a").add_blocks(5);
        let blocks = chain.blocks();

        assert_eq!(blocks.len(), 6);
        assert_eq!(chain.height(), 5);
        for i in 1..blocks.len() {
            assert_eq!(blocks[i].parent_hash, blocks[i - 1].hash);
        }
    }

    #[test]
    fn test_fork_shares_prefix() {
        let main = ChainBuilder::new("a").add_blocks(5);
        let fork = main.fork_at(4, "b").add_blocks(2);

        assert_eq!(fork.height(), 5);
        assert_eq!(fork.block(3), main.block(3));
        assert_ne!(fork.block(4).unwrap().hash, main.block(4).unwrap().hash);
        assert_eq!(fork.block(4).unwrap().parent_hash, main.block(3).unwrap().hash);
    }

    #[test]
    fn test_custom_block_carries_uncles_and_burn() {
        let chain = ChainBuilder::new("a")
            .add_blocks(2)
            .add_custom_block(|b| b.add_uncle(1).base_fee(10, 21_000));
        let block = chain.block(3).unwrap();

        assert_eq!(block.uncle_no, 1);
        assert_eq!(block.uncles.len(), 1);
        assert_eq!(block.burned, U256::from(210_000u64));
    }
}
