//! Transaction trace pass.
//!
//! After the block sync, [`ChainSync::trace_cycle`] walks the canonical
//! blocks from the trace start block (or just past the last traced block)
//! up to the stored head, in batches of `batch_blocks`. Each batch runs one
//! [`Synchronizer`] with a task per block that has transactions: the node
//! traces every transaction of the block in the unordered phase, and the
//! ordered phase writes the block's traces in one storage call.
//!
//! A failed trace or a failed write aborts the batch and ends the pass.
//! Because a block's traces are written all at once and in block order, the
//! highest traced block is always complete, and the next pass resumes right
//! after it.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::{ChainSync, NodeAdapter, StorageAdapter, SyncContext, SyncResult, Synchronizer, TxTrace};

/// How a trace pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOutcome {
    /// Tracing is switched off.
    Disabled,
    /// Another cycle held the context.
    Busy,
    /// The stored head has not reached the trace start block.
    Waiting { head: u64, start_block: u64 },
    /// Every stored block has been traced.
    UpToDate { height: u64 },
    /// Blocks `from..=to` were traced.
    Completed { from: u64, to: u64, traced: u64 },
    /// A batch aborted; `traced` counts what was written before it.
    Aborted { from: u64, to: u64, traced: u64 },
}

impl TraceOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TraceOutcome::Aborted { .. })
    }
}

/// Group `(block, hash)` pairs by block, keeping their order.
fn group_by_block(hashes: Vec<(u64, String)>) -> Vec<(u64, Vec<String>)> {
    let mut blocks: Vec<(u64, Vec<String>)> = Vec::new();
    for (number, hash) in hashes {
        match blocks.last_mut() {
            Some((last, txs)) if *last == number => txs.push(hash),
            _ => blocks.push((number, vec![hash])),
        }
    }
    blocks
}

impl<N, S> ChainSync<N, S>
where
    N: NodeAdapter + 'static,
    S: StorageAdapter + 'static,
{
    /// Trace the transactions of every stored block not traced yet.
    ///
    /// Errors are only returned when the stored head can't be read.
    pub async fn trace_cycle(&self, ctx: &SyncContext) -> SyncResult<TraceOutcome> {
        let tracing = &self.config.tracing;
        if !tracing.enabled {
            return Ok(TraceOutcome::Disabled);
        }

        let Some(_guard) = ctx.try_begin() else {
            warn!("Sync already in progress; skipping trace pass");
            return Ok(TraceOutcome::Busy);
        };

        let head = self.storage.latest_block().await?.map(|b| b.number);
        let Some(head) = head.filter(|&head| head >= tracing.start_block) else {
            let head = head.unwrap_or(0);
            warn!(
                "skipping trace pass, head {} hasn't reached start block {}",
                head, tracing.start_block
            );
            return Ok(TraceOutcome::Waiting {
                head,
                start_block: tracing.start_block,
            });
        };

        let from = match self.storage.latest_tx_trace().await {
            Ok(Some(latest)) => (latest.origin_block_no + 1).max(tracing.start_block),
            Ok(None) => tracing.start_block,
            Err(e) => {
                debug!("couldn't get latest tx trace: {}", e);
                tracing.start_block
            }
        };
        if from > head {
            debug!("traces are at head {}", head);
            return Ok(TraceOutcome::UpToDate { height: head });
        }

        info!("Tracing transactions in blocks {} to {}", from, head);
        let batch_blocks = tracing.batch_blocks.max(1);
        let mut traced = 0;
        let mut batch_from = from;

        while batch_from <= head {
            let batch_to = batch_from.saturating_add(batch_blocks - 1).min(head);
            let started = Instant::now();

            let hashes = match self.storage.canonical_tx_hashes(batch_from, batch_to).await {
                Ok(hashes) => hashes,
                Err(e) => {
                    error!(
                        "couldn't get transactions of blocks {} to {}: {}",
                        batch_from, batch_to, e
                    );
                    return Ok(TraceOutcome::Aborted {
                        from,
                        to: head,
                        traced,
                    });
                }
            };

            let count = hashes.len();
            let (written, aborted) = self.trace_batch(hashes).await;
            traced += written;

            if aborted {
                error!(
                    "trace pass aborted in blocks {} to {} after {} traces",
                    batch_from, batch_to, traced
                );
                return Ok(TraceOutcome::Aborted {
                    from,
                    to: head,
                    traced,
                });
            }

            info!(
                "Synced tx traces head={} count={} took={:?}",
                batch_to,
                count,
                started.elapsed()
            );
            batch_from = batch_to + 1;
        }

        Ok(TraceOutcome::Completed {
            from,
            to: head,
            traced,
        })
    }

    /// Run one pipeline over a batch, returning traces written and whether
    /// it aborted.
    async fn trace_batch(&self, hashes: Vec<(u64, String)>) -> (u64, bool) {
        let pipeline = Synchronizer::new(self.config.tracing.max_routines);
        let written = Arc::new(AtomicU64::new(0));

        for (number, txs) in group_by_block(hashes) {
            let node = self.node.clone();
            let storage = self.storage.clone();
            let written = written.clone();

            let admitted = pipeline
                .add_link(move |mut task| async move {
                    let mut traces = Vec::with_capacity(txs.len());
                    for hash in txs {
                        match node.trace_transaction(&hash).await {
                            Ok(trace) => traces.push(TxTrace {
                                origin_tx_hash: hash,
                                origin_block_no: number,
                                trace,
                            }),
                            Err(e) => {
                                error!(
                                    "couldn't get internal tx {} in block {}: {}",
                                    hash, number, e
                                );
                                task.abort();
                                return;
                            }
                        }
                    }

                    if task.wait().await {
                        return;
                    }

                    if let Err(e) = storage.add_tx_traces(&traces).await {
                        error!("couldn't add traces of block {} to db: {}", number, e);
                        task.abort();
                        return;
                    }
                    written.fetch_add(traces.len() as u64, Ordering::SeqCst);
                })
                .await;

            if !admitted {
                debug!("trace pipeline aborted; not enqueuing block {}", number);
                break;
            }
        }

        let aborted = pipeline.finish().await;
        (written.load(Ordering::SeqCst), aborted)
    }
}
