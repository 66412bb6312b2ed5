//! Batched progress reporting for a sync cycle.
//!
//! Block commits push one [`SegmentEvent`] each; a background task folds them
//! into segments and logs a summary line every `batch_blocks` blocks or every
//! `interval`, whichever comes first. Closing the logger flushes the last
//! partial segment and hands back the totals for the whole cycle.

use alloy_primitives::U256;
use log::{error, info};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What one committed block contributed.
#[derive(Debug, Clone, Default)]
pub struct SegmentEvent {
    pub block_no: u64,
    pub txns: u64,
    pub token_transfers: u64,
    pub contracts_deployed: u64,
    pub contract_calls: u64,
    pub uncles: u64,
    pub minted: U256,
    pub supply: U256,
}

/// Aggregate over a run of committed blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentTotals {
    pub blocks: u64,
    pub head: u64,
    pub txns: u64,
    pub token_transfers: u64,
    pub contracts_deployed: u64,
    pub contract_calls: u64,
    pub uncles: u64,
    pub minted: U256,
    pub supply: U256,
}

impl SegmentTotals {
    fn add(&mut self, event: &SegmentEvent) {
        self.blocks += 1;
        self.head = event.block_no;
        self.txns += event.txns;
        self.token_transfers += event.token_transfers;
        self.contracts_deployed += event.contracts_deployed;
        self.contract_calls += event.contract_calls;
        self.uncles += event.uncles;
        self.minted += event.minted;
        self.supply = event.supply;
    }
}

/// Cloneable handle used by block tasks to report commits.
#[derive(Clone)]
pub struct SegmentSink {
    events: mpsc::UnboundedSender<SegmentEvent>,
}

impl SegmentSink {
    pub fn log(&self, event: SegmentEvent) {
        if self.events.send(event).is_err() {
            error!("segment logger already closed, dropping event");
        }
    }
}

pub struct SegmentLogger {
    sink: SegmentSink,
    handle: JoinHandle<SegmentTotals>,
}

impl SegmentLogger {
    /// Spawn the aggregation task. Must be called from within a tokio runtime.
    pub fn start(batch_blocks: usize, interval: Duration) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_segments(rx, batch_blocks.max(1) as u64, interval));
        Self {
            sink: SegmentSink { events },
            handle,
        }
    }

    pub fn sink(&self) -> SegmentSink {
        self.sink.clone()
    }

    /// Flush and stop, returning the totals for everything logged.
    ///
    /// Only returns once every outstanding [`SegmentSink`] clone is dropped.
    pub async fn close(self) -> SegmentTotals {
        let SegmentLogger { sink, handle } = self;
        drop(sink);
        match handle.await {
            Ok(totals) => totals,
            Err(e) => {
                error!("segment logger task failed: {}", e);
                SegmentTotals::default()
            }
        }
    }
}

fn emit(segment: &SegmentTotals, took: Duration) {
    info!(
        "Imported new chain segment blocks={} head={} transactions={} transfers={} contracts={} contractCalls={} uncles={} minted={} supply={} took={:?}",
        segment.blocks,
        segment.head,
        segment.txns,
        segment.token_transfers,
        segment.contracts_deployed,
        segment.contract_calls,
        segment.uncles,
        segment.minted,
        segment.supply,
        took
    );
}

async fn run_segments(
    mut events: mpsc::UnboundedReceiver<SegmentEvent>,
    batch_blocks: u64,
    interval: Duration,
) -> SegmentTotals {
    let mut totals = SegmentTotals::default();
    let mut segment = SegmentTotals::default();
    let mut start = Instant::now();

    while let Some(event) = events.recv().await {
        totals.add(&event);
        segment.add(&event);

        if segment.blocks >= batch_blocks || start.elapsed() >= interval {
            emit(&segment, start.elapsed());
            segment = SegmentTotals::default();
            start = Instant::now();
        }
    }

    if segment.blocks > 0 {
        emit(&segment, start.elapsed());
    }

    totals
}
