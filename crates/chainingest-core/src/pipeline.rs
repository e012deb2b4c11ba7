//! Top-level orchestrator.
//!
//! Owns the injected collaborators and wires them into the running
//! pipeline: lock task, processor, retry manager, synchronizer. All
//! references point downward; cancellation propagates through child
//! tokens. In-flight block work runs to its next natural checkpoint and a
//! partially processed block is re-queued on the next startup via the
//! back-fill gap logic.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::config::{IngestConfig, IngestMode};
use crate::error::IngestError;
use crate::lock::ProcessQueueLock;
use crate::node::{HeadFeed, NodeClient};
use crate::processor::BlockProcessor;
use crate::progress::SyncProgress;
use crate::retry::RetryManager;
use crate::store::Store;
use crate::sync::Synchronizer;
use crate::watermark::HighWaterMark;

pub struct Ingestor {
    config: IngestConfig,
    node: Arc<dyn NodeClient>,
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,
    progress: Arc<SyncProgress>,
}

impl Ingestor {
    pub fn new(
        config: IngestConfig,
        node: Arc<dyn NodeClient>,
        store: Arc<dyn Store>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self {
            config,
            node,
            store,
            bus,
            progress: Arc::new(SyncProgress::new()),
        }
    }

    /// Shared progress counters, for external reporting.
    pub fn progress(&self) -> Arc<SyncProgress> {
        Arc::clone(&self.progress)
    }

    /// Run the pipeline until `cancel` fires or the head feed closes.
    pub async fn run(
        self,
        head_feed: Box<dyn HeadFeed>,
        cancel: CancellationToken,
    ) -> Result<(), IngestError> {
        let watermark = match &self.config.watermark_path {
            Some(path) => Some(Arc::new(HighWaterMark::load(path.clone()).await?)),
            None => None,
        };
        if self.config.mode == IngestMode::Publish && watermark.is_none() {
            warn!("publish-only mode without a high-water mark: back-fill cannot resume across restarts");
        }

        info!(
            mode = %self.config.mode,
            workers = self.config.worker_pool_size(),
            "starting ingestion pipeline"
        );

        let lock = ProcessQueueLock::start(cancel.child_token());
        let processor = Arc::new(BlockProcessor::new(
            &self.config,
            Arc::clone(&self.node),
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            lock.clone(),
            Arc::clone(&self.progress),
            watermark.clone(),
        ));

        let retry = RetryManager::new(
            &self.config,
            Arc::clone(&self.bus),
            lock.clone(),
            Arc::clone(&processor),
            Arc::clone(&self.progress),
            cancel.child_token(),
        );
        let synchronizer = Synchronizer::new(
            &self.config,
            Arc::clone(&self.node),
            Arc::clone(&self.store),
            Arc::clone(&processor),
            watermark,
            cancel.child_token(),
        );

        let retry_task = tokio::spawn(retry.run());
        let sync_task = tokio::spawn(synchronizer.run(head_feed));
        let _ = tokio::join!(retry_task, sync_task);

        info!("ingestion pipeline stopped");
        Ok(())
    }
}
