//! The retry manager.
//!
//! A long-lived loop that drains the bus retry queue every tick,
//! re-submitting block numbers to the processor while enforcing the
//! per-block attempt ceiling. A block that consistently fails is abandoned
//! with a terminal log line after `max_attempts`; a transiently-failing
//! block eventually succeeds under normal recovery timescales.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::Bus;
use crate::config::IngestConfig;
use crate::lock::ProcessQueueLock;
use crate::processor::{BlockProcessor, BlockRef};
use crate::progress::SyncProgress;

pub struct RetryManager {
    bus: Arc<dyn Bus>,
    lock: ProcessQueueLock,
    processor: Arc<BlockProcessor>,
    progress: Arc<SyncProgress>,
    tick: Duration,
    batch: usize,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl RetryManager {
    pub fn new(
        config: &IngestConfig,
        bus: Arc<dyn Bus>,
        lock: ProcessQueueLock,
        processor: Arc<BlockProcessor>,
        progress: Arc<SyncProgress>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            lock,
            processor,
            progress,
            tick: config.retry_tick(),
            batch: config.retry_batch,
            max_attempts: config.max_attempts,
            cancel,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("retry manager shut down");
                    return;
                }

                _ = interval.tick() => self.drain_once().await,
            }
        }
    }

    /// Pop up to `batch` numbers and re-submit the ones still worth trying.
    async fn drain_once(&self) {
        if self.bus.retry_len().await == 0 {
            return;
        }
        for _ in 0..self.batch {
            let Some(number) = self.bus.pop_retry().await else {
                break;
            };

            let count = self.bus.attempts(number).await;
            if count >= self.max_attempts {
                error!(
                    number,
                    attempts = count,
                    "giving up on block after max attempts"
                );
                self.bus.clear_attempts(number).await;
                self.progress.record_abandoned();
                continue;
            }

            // Deduplicate against in-flight work: if a worker holds the
            // number right now, this entry is surplus. The holder either
            // succeeds or re-queues it itself.
            if self.lock.is_held(number).await {
                debug!(number, "block already in flight, dropping duplicate retry");
                continue;
            }

            debug!(number, attempts = count, "re-submitting block from retry queue");
            Arc::clone(&self.processor).spawn(BlockRef::Number(number));
        }
    }
}
