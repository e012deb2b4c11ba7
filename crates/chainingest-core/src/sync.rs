//! The synchronizer.
//!
//! Two overlapping phases: back-fill of the gap between the last indexed
//! number and the chain head, then live following of new heads. Back-fill
//! is rate-limited by a block-level semaphore on top of the same per-number
//! lock live traffic uses, so the two phases can safely overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::node::{HeadFeed, NodeClient};
use crate::processor::{BlockProcessor, BlockRef};
use crate::store::Store;
use crate::watermark::HighWaterMark;

pub struct Synchronizer {
    node: Arc<dyn NodeClient>,
    store: Arc<dyn Store>,
    processor: Arc<BlockProcessor>,
    watermark: Option<Arc<HighWaterMark>>,
    from_block: u64,
    backfill_concurrency: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Synchronizer {
    pub fn new(
        config: &IngestConfig,
        node: Arc<dyn NodeClient>,
        store: Arc<dyn Store>,
        processor: Arc<BlockProcessor>,
        watermark: Option<Arc<HighWaterMark>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node,
            store,
            processor,
            watermark,
            from_block: config.from_block,
            backfill_concurrency: config.worker_pool_size(),
            poll_interval: config.poll_interval(),
            cancel,
        }
    }

    /// Run both phases. Returns when the head feed closes or the pipeline
    /// is cancelled.
    pub async fn run(self, head_feed: Box<dyn HeadFeed>) {
        tokio::join!(self.backfill(), self.live(head_feed));
    }

    /// Catch up from the last indexed number to the chain head.
    async fn backfill(&self) {
        let head = loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.node.chain_head().await {
                Ok(head) => break head,
                Err(e) => {
                    warn!(error = %e, "failed to query chain head for back-fill");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        };

        // The store is authoritative in persist modes; the high-water mark
        // covers publish-only mode, where nothing reaches the store.
        let resume = {
            let stored = self.store.last_indexed_number().await;
            let marked = self.watermark.as_ref().and_then(|mark| mark.get());
            stored.into_iter().chain(marked).max()
        };
        let start = match resume {
            Some(last) => last + 1,
            None => self.from_block,
        };
        if start > head {
            info!(head, "already caught up, nothing to back-fill");
            return;
        }

        info!(start, head, blocks = head - start + 1, "starting back-fill");
        let semaphore = Arc::new(Semaphore::new(self.backfill_concurrency));
        for number in start..=head {
            if self.cancel.is_cancelled() {
                return;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                return;
            };
            let processor = Arc::clone(&self.processor);
            tokio::spawn(async move {
                let _permit = permit;
                processor.process(BlockRef::Number(number)).await;
            });
        }
        info!(head, "back-fill submitted");
    }

    /// Follow new heads until the feed closes or the pipeline is cancelled.
    async fn live(&self, mut feed: Box<dyn HeadFeed>) {
        let mut last_head: Option<u64> = None;
        loop {
            let head = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("live follow shut down");
                    return;
                }

                head = feed.next_head() => head,
            };
            let Some(head) = head else {
                warn!("head feed closed, live follow stopping");
                return;
            };

            if let Some(previous) = last_head {
                if head.number <= previous {
                    // Head number went backwards: chain reorg. Re-submit the
                    // affected range; the store overwrites by hash.
                    warn!(
                        from = head.number,
                        to = previous,
                        "head went backwards, re-submitting range"
                    );
                    for number in (head.number + 1)..=previous {
                        Arc::clone(&self.processor).spawn(BlockRef::Number(number));
                    }
                } else if head.number > previous + 1 {
                    // Missed notifications: fill the gap by number.
                    debug!(
                        from = previous + 1,
                        to = head.number - 1,
                        "filling head gap"
                    );
                    for number in (previous + 1)..head.number {
                        Arc::clone(&self.processor).spawn(BlockRef::Number(number));
                    }
                }
            }
            last_head = Some(head.number);

            let processor = Arc::clone(&self.processor);
            match head.hash {
                Some(hash) => processor.spawn(BlockRef::Hash {
                    hash,
                    number: head.number,
                }),
                None => processor.spawn(BlockRef::Number(head.number)),
            }
        }
    }
}
