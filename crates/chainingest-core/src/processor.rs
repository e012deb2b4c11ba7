//! The block processor.
//!
//! Given a block identifier, fetches the header and transaction bodies,
//! gathers every receipt and sender through a bounded worker pool, then
//! applies the mode-specific persist/publish action and updates progress.
//!
//! Receipts are fetched in completion order but committed in consensus
//! order: worker results are slotted by transaction index before any store
//! call. Nothing is persisted or published until every transaction of the
//! block has been fetched, so a partial fetch leaves no partial rows.
//!
//! Failure routing:
//! - transient node errors and store write failures → retry queue + attempt
//!   counter bump
//! - number past the chain head → dropped silently (the synchronizer will
//!   re-issue it)
//! - lock no-go → retry queue without a bump (contention, not failure)
//! - malformed node data → one retry, then terminal
//! - publish failure → logged, never retried, never blocks persistence

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, TOPIC_BLOCK, TOPIC_EVENT, TOPIC_TRANSACTION};
use crate::config::{IngestConfig, IngestMode};
use crate::error::NodeError;
use crate::lock::{Acquisition, ProcessQueueLock};
use crate::node::NodeClient;
use crate::progress::SyncProgress;
use crate::store::Store;
use crate::types::{Block, FetchedBlock, PackedTransaction, TxBody};
use crate::watermark::HighWaterMark;

/// How a block is addressed for processing. Heads from a subscription carry
/// a hash; back-fill and retries only know the number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRef {
    Number(u64),
    Hash { hash: String, number: u64 },
}

impl BlockRef {
    pub fn number(&self) -> u64 {
        match self {
            Self::Number(number) => *number,
            Self::Hash { number, .. } => *number,
        }
    }
}

enum ProcessOutcome {
    Indexed { txs: usize, events: usize },
    AlreadyIndexed,
    PastHead,
    Failed(FailReason),
}

enum FailReason {
    Transient(String),
    Malformed(String),
    Persist,
}

/// Per-block fetch / persist / publish worker. One instance serves the whole
/// pipeline; every submission runs [`BlockProcessor::process`] as its own
/// task.
pub struct BlockProcessor {
    node: Arc<dyn NodeClient>,
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,
    lock: ProcessQueueLock,
    progress: Arc<SyncProgress>,
    watermark: Option<Arc<HighWaterMark>>,
    mode: IngestMode,
    pool_size: usize,
}

impl BlockProcessor {
    pub fn new(
        config: &IngestConfig,
        node: Arc<dyn NodeClient>,
        store: Arc<dyn Store>,
        bus: Arc<dyn Bus>,
        lock: ProcessQueueLock,
        progress: Arc<SyncProgress>,
        watermark: Option<Arc<HighWaterMark>>,
    ) -> Self {
        Self {
            mode: config.mode,
            pool_size: config.worker_pool_size(),
            node,
            store,
            bus,
            lock,
            progress,
            watermark,
        }
    }

    /// Submit a block for processing on its own task. This is the single
    /// entry path shared by the synchronizer and the retry manager.
    pub fn spawn(self: Arc<Self>, block: BlockRef) {
        tokio::spawn(async move { self.process(block).await });
    }

    /// Process one block end to end.
    pub async fn process(&self, block: BlockRef) {
        let number = block.number();

        let ticket = match self.lock.acquire(number).await {
            Some(Acquisition::Immediate(ticket)) => ticket,
            Some(Acquisition::Queued(ticket, verdict)) => {
                debug!(number, "block already in flight, waiting for verdict");
                match verdict.await {
                    Ok(true) => ticket,
                    // No-go is normal contention: defer to the retry queue
                    // without touching the attempt counter.
                    _ => {
                        debug!(number, "no-go verdict, deferring block to retry queue");
                        self.bus.push_retry(number).await;
                        return;
                    }
                }
            }
            None => return, // lock task gone; shutting down
        };

        let started = Instant::now();
        let outcome = self.run_locked(&block).await;
        self.lock.release(number, ticket);

        match outcome {
            ProcessOutcome::Indexed { txs, events } => {
                self.progress.record_block(txs as u64, events as u64);
                self.bus.clear_attempts(number).await;
                if let Some(mark) = &self.watermark {
                    if let Err(e) = mark.advance(number).await {
                        warn!(number, error = %e, "failed to advance high-water mark");
                    }
                }
                info!(
                    number,
                    txs,
                    events,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "block processed"
                );
            }
            ProcessOutcome::AlreadyIndexed => {
                self.bus.clear_attempts(number).await;
                debug!(number, "block already indexed");
            }
            ProcessOutcome::PastHead => {
                debug!(number, "block not yet available");
            }
            ProcessOutcome::Failed(reason) => self.fail(number, reason).await,
        }
    }

    async fn run_locked(&self, block: &BlockRef) -> ProcessOutcome {
        let fetched = match block {
            BlockRef::Number(number) => self.node.block_by_number(*number).await,
            BlockRef::Hash { hash, .. } => {
                if self.mode.persists() && self.store.exists_block(hash).await {
                    return ProcessOutcome::AlreadyIndexed;
                }
                self.node.block_by_hash(hash).await
            }
        };
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(NodeError::NotFound) => return ProcessOutcome::PastHead,
            Err(NodeError::Malformed(detail)) => {
                return ProcessOutcome::Failed(FailReason::Malformed(detail))
            }
            Err(NodeError::Transient(detail)) => {
                return ProcessOutcome::Failed(FailReason::Transient(detail))
            }
        };

        // Gather every receipt and sender before any side effect, so a
        // fetch failure leaves no partial rows behind.
        let packed = if fetched.txs.is_empty() {
            Vec::new()
        } else {
            match self.collect_transactions(&fetched).await {
                Ok(packed) => packed,
                Err(failed) => {
                    return ProcessOutcome::Failed(FailReason::Transient(format!(
                        "{failed} of {} transactions failed to fetch",
                        fetched.txs.len()
                    )))
                }
            }
        };

        self.apply(&fetched.block, &packed).await
    }

    /// Fan the block's transactions out over the bounded worker pool and
    /// collect the packed results in consensus order.
    async fn collect_transactions(
        &self,
        fetched: &FetchedBlock,
    ) -> Result<Vec<PackedTransaction>, usize> {
        let total = fetched.txs.len();
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        // Buffer sized to the pool: no more than pool_size workers are in
        // flight, so a send never blocks a worker holding a permit.
        let (results_tx, mut results_rx) =
            mpsc::channel::<(usize, Option<PackedTransaction>)>(self.pool_size);

        for (index, body) in fetched.txs.iter().cloned().enumerate() {
            let node = Arc::clone(&self.node);
            let semaphore = Arc::clone(&semaphore);
            let results = results_tx.clone();
            let block_hash = fetched.block.hash.clone();
            let number = fetched.block.number;
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let packed = fetch_one(node.as_ref(), &body, &block_hash, number).await;
                let _ = results.send((index, packed)).await;
            });
        }
        drop(results_tx);

        // Results arrive in completion order; slot them by transaction
        // index so the committed order matches consensus order.
        let mut slots: Vec<Option<PackedTransaction>> = vec![None; total];
        while let Some((index, packed)) = results_rx.recv().await {
            slots[index] = packed;
        }

        let failed = slots.iter().filter(|slot| slot.is_none()).count();
        if failed > 0 {
            return Err(failed);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Apply the mode-specific action: publish first, then persist. A
    /// persist failure retries the block; a publish failure is logged only.
    async fn apply(&self, block: &Block, packed: &[PackedTransaction]) -> ProcessOutcome {
        if self.mode.publishes() {
            if self.publish_json(TOPIC_BLOCK, block).await {
                self.progress.record_published();
            } else {
                warn!(number = block.number, "failed to publish block");
            }
        }
        if self.mode.persists() && !self.store.put_block(block).await {
            return ProcessOutcome::Failed(FailReason::Persist);
        }

        for item in packed {
            if self.mode.publishes() {
                self.publish_transaction(item).await;
            }
            if self.mode.persists() {
                // Transaction first, then its events: the events table
                // carries a foreign key to transactions.
                if !self.store.put_transaction(&item.transaction).await {
                    return ProcessOutcome::Failed(FailReason::Persist);
                }
                if !self.store.put_events(&item.events).await {
                    return ProcessOutcome::Failed(FailReason::Persist);
                }
            }
        }

        ProcessOutcome::Indexed {
            txs: packed.len(),
            events: packed.iter().map(|item| item.events.len()).sum(),
        }
    }

    async fn publish_transaction(&self, item: &PackedTransaction) {
        if !self.publish_json(TOPIC_TRANSACTION, &item.transaction).await {
            warn!(tx = %item.transaction.hash, "failed to publish transaction");
        }
        for event in &item.events {
            if !self.publish_json(TOPIC_EVENT, event).await {
                warn!(tx = %event.tx_hash, index = event.index, "failed to publish event");
            }
        }
    }

    async fn publish_json<T: serde::Serialize>(&self, topic: &str, record: &T) -> bool {
        match serde_json::to_value(record) {
            Ok(payload) => self.bus.publish(topic, payload).await,
            Err(e) => {
                warn!(topic, error = %e, "failed to encode payload");
                false
            }
        }
    }

    async fn fail(&self, number: u64, reason: FailReason) {
        match reason {
            FailReason::Transient(detail) => {
                let count = self.bus.bump_attempts(number).await;
                warn!(
                    number,
                    attempts = count,
                    detail = %detail,
                    "block processing failed, queued for retry"
                );
                self.bus.push_retry(number).await;
            }
            FailReason::Persist => {
                let count = self.bus.bump_attempts(number).await;
                warn!(number, attempts = count, "failed to persist block, queued for retry");
                self.bus.push_retry(number).await;
            }
            FailReason::Malformed(detail) => {
                let count = self.bus.bump_attempts(number).await;
                if count >= 2 {
                    error!(
                        number,
                        attempts = count,
                        detail = %detail,
                        "giving up on block: repeated malformed node data"
                    );
                    self.bus.clear_attempts(number).await;
                    self.progress.record_abandoned();
                } else {
                    warn!(number, detail = %detail, "malformed node data, retrying block once");
                    self.bus.push_retry(number).await;
                }
            }
        }
    }
}

async fn fetch_one(
    node: &dyn NodeClient,
    body: &TxBody,
    block_hash: &str,
    number: u64,
) -> Option<PackedTransaction> {
    let receipt = match node.transaction_receipt(&body.hash).await {
        Ok(receipt) => receipt,
        Err(e) => {
            warn!(number, tx = %body.hash, error = %e, "failed to fetch transaction receipt");
            return None;
        }
    };
    let sender = match node
        .transaction_sender(block_hash, receipt.transaction_index)
        .await
    {
        Ok(sender) => sender,
        Err(e) => {
            warn!(number, tx = %body.hash, error = %e, "failed to recover transaction sender");
            return None;
        }
    };
    Some(PackedTransaction::pack(body, &sender, &receipt))
}
