//! Atomic per-pair buffering in front of the reconciler.
//!
//! Every pair task hands its complete [`PairBatch`] to [`PairBuffer::add_pair`].
//! The append, the threshold check and the swap of the buffer contents happen
//! under one lock, so a flush can never see half of a pair. Swapped snapshots
//! are queued to a single flush worker that reconciles them one after the
//! other; the durable write itself happens outside the buffer lock.

use crate::harvest::pipeline::PipelineError;
use crate::model::{ConsolidatedTariffRecord, FlushBatch, PairBatch};
use crate::store::{StoreError, TariffStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// Snapshots that may wait for the flush worker before `add_pair` blocks.
const FLUSH_QUEUE_DEPTH: usize = 4;

/// Pairs between two progress log lines.
const PROGRESS_EVERY: u64 = 100;

/// Accumulator shared by all pair tasks of one run.
#[derive(Debug, Default)]
struct BufferState {
    pending_records: Vec<ConsolidatedTariffRecord>,
    pending_product_links: HashMap<Uuid, String>,
    pairs_since_flush: usize,
    pairs_processed: u64,
    tariffs_accepted: u64,
    /// `None` once the buffer is finished
    sender: Option<mpsc::Sender<FlushBatch>>,
}

impl BufferState {
    fn take_snapshot(&mut self) -> FlushBatch {
        FlushBatch {
            records: std::mem::take(&mut self.pending_records),
            product_links: std::mem::take(&mut self.pending_product_links),
            pairs: std::mem::replace(&mut self.pairs_since_flush, 0),
        }
    }
}

/// Counters visible after an `add_pair`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub pairs_processed: u64,
    pub tariffs_accepted: u64,
    /// Records waiting for the next flush
    pub buffered_records: usize,
    /// Whether this addition swapped the buffer out for a flush
    pub flushed: bool,
}

/// Totals reported by the flush worker once it has drained its queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushTotals {
    pub flushes: u64,
    pub tariffs_saved: u64,
    pub inserted: u64,
    pub updated: u64,
}

pub struct PairBuffer {
    state: Mutex<BufferState>,
    worker: Mutex<Option<JoinHandle<Result<FlushTotals, StoreError>>>>,
    flush_threshold: usize,
    expected_pairs: u64,
}

impl PairBuffer {
    /// Creates an empty buffer and spawns its flush worker on the current
    /// runtime.
    pub fn new<S>(store: Arc<S>, flush_threshold: usize) -> Self
    where
        S: TariffStore + 'static,
    {
        let (sender, receiver) = mpsc::channel(FLUSH_QUEUE_DEPTH);
        let worker = tokio::spawn(run_flush_worker(store, receiver));
        Self {
            state: Mutex::new(BufferState {
                sender: Some(sender),
                ..Default::default()
            }),
            worker: Mutex::new(Some(worker)),
            flush_threshold: flush_threshold.max(1),
            expected_pairs: 0,
        }
    }

    /// Total pair count used in progress lines.
    pub fn with_expected_pairs(mut self, expected_pairs: u64) -> Self {
        self.expected_pairs = expected_pairs;
        self
    }

    /// Appends one pair's full contribution.
    ///
    /// Pairs without records count toward the flush threshold like any other.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::FlushWorkerGone`] if an earlier flush failed
    /// or the buffer was already finished.
    pub async fn add_pair(&self, batch: PairBatch) -> Result<AddOutcome, PipelineError> {
        let mut state = self.state.lock().await;
        if state.sender.is_none() {
            return Err(PipelineError::FlushWorkerGone);
        }

        state.tariffs_accepted += batch.records.len() as u64;
        state.pending_records.extend(batch.records);
        state.pending_product_links.extend(batch.product_links);
        state.pairs_since_flush += 1;
        state.pairs_processed += 1;

        if state.pairs_processed % PROGRESS_EVERY == 0 {
            info!(
                processed = state.pairs_processed,
                total = self.expected_pairs,
                tariffs = state.tariffs_accepted,
                buffered_pairs = state.pairs_since_flush,
                "Harvest progress"
            );
        }

        let flushed = state.pairs_since_flush >= self.flush_threshold;
        if flushed {
            swap_and_send(&mut state).await?;
        }

        Ok(AddOutcome {
            pairs_processed: state.pairs_processed,
            tariffs_accepted: state.tariffs_accepted,
            buffered_records: state.pending_records.len(),
            flushed,
        })
    }

    /// Flushes whatever is left, even below the threshold.
    ///
    /// No-op if nothing was added since the last flush.
    pub async fn drain_remainder(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        if state.pairs_since_flush == 0 && state.pending_records.is_empty() {
            return Ok(());
        }
        if state.sender.is_none() {
            return Err(PipelineError::FlushWorkerGone);
        }
        info!(
            pairs = state.pairs_since_flush,
            tariffs = state.pending_records.len(),
            "Final flush"
        );
        swap_and_send(&mut state).await
    }

    /// Pairs added so far.
    pub async fn pairs_processed(&self) -> u64 {
        self.state.lock().await.pairs_processed
    }

    /// Closes the flush queue and waits for every queued snapshot to be
    /// reconciled.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Reconciliation`] with the first store error;
    /// snapshots queued after it were not written.
    pub async fn finish(&self) -> Result<FlushTotals, PipelineError> {
        self.state.lock().await.sender = None;
        let Some(worker) = self.worker.lock().await.take() else {
            return Err(PipelineError::FlushWorkerGone);
        };
        match worker.await {
            Ok(Ok(totals)) => Ok(totals),
            Ok(Err(e)) => Err(PipelineError::Reconciliation(e)),
            Err(e) => Err(PipelineError::Task(e.to_string())),
        }
    }
}

/// Swaps the buffer out and queues it. Must be called with the lock held so
/// snapshots reach the worker in swap order.
async fn swap_and_send(state: &mut BufferState) -> Result<(), PipelineError> {
    let snapshot = state.take_snapshot();
    if snapshot.records.is_empty() {
        return Ok(());
    }
    let Some(sender) = state.sender.as_ref() else {
        return Err(PipelineError::FlushWorkerGone);
    };
    sender
        .send(snapshot)
        .await
        .map_err(|_| PipelineError::FlushWorkerGone)
}

async fn run_flush_worker<S>(
    store: Arc<S>,
    mut receiver: mpsc::Receiver<FlushBatch>,
) -> Result<FlushTotals, StoreError>
where
    S: TariffStore + 'static,
{
    let mut totals = FlushTotals::default();
    while let Some(batch) = receiver.recv().await {
        info!(
            pairs = batch.pairs,
            tariffs = batch.records.len(),
            backend = store.backend_name(),
            "Flushing pairs"
        );
        let summary = store
            .reconcile(&batch.records, &batch.product_links)
            .await
            .map_err(|e| {
                error!(
                    pairs = batch.pairs,
                    tariffs = batch.records.len(),
                    error = %e,
                    "Flush failed, batch not persisted"
                );
                e
            })?;
        totals.flushes += 1;
        totals.tariffs_saved += batch.records.len() as u64;
        totals.inserted += summary.inserted;
        totals.updated += summary.updated;
        if summary.inserted > 0 || summary.updated > 0 {
            info!(
                inserted = summary.inserted,
                updated = summary.updated,
                "Flush committed"
            );
        }
    }
    Ok(totals)
}
