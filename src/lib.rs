//! Spectrum Test Suite
//!
//! End-to-end scenarios for the chain sync engine, run against the in-memory
//! node and storage adapters from `spectrum-sync`.

pub mod block_builder;

#[cfg(test)]
mod tests;

pub use block_builder::{BlockBuilder, ChainBlock, ChainBuilder};
