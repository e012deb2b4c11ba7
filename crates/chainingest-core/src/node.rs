//! The node client seam: a thin typed facade over the upstream JSON-RPC
//! endpoint, plus the head feed abstraction used by the live phase.
//!
//! No caching, no retry — retry policy belongs to the block processor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::NodeError;
use crate::types::{FetchedBlock, Receipt};

/// Typed read-only view of the upstream node.
///
/// Every error is classified as transient / not-found / malformed
/// ([`NodeError`]); `NotFound` from [`NodeClient::block_by_number`] for a
/// number past the chain head is the normal waited-past-tip signal.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Current tip block number of the canonical chain.
    async fn chain_head(&self) -> Result<u64, NodeError>;

    /// Fetch a block with full transaction bodies by number.
    async fn block_by_number(&self, number: u64) -> Result<FetchedBlock, NodeError>;

    /// Fetch a block with full transaction bodies by hash.
    async fn block_by_hash(&self, hash: &str) -> Result<FetchedBlock, NodeError>;

    /// Fetch the execution receipt for a transaction.
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Receipt, NodeError>;

    /// Recover the sender address of the transaction at `index` in the
    /// block with `block_hash`.
    async fn transaction_sender(&self, block_hash: &str, index: u32) -> Result<String, NodeError>;
}

/// A new chain head observed by the live phase. The hash is present when the
/// head came from a subscription; polling only learns the number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub number: u64,
    pub hash: Option<String>,
}

/// Source of new chain heads for the synchronizer's live phase.
#[async_trait]
pub trait HeadFeed: Send {
    /// The next head, or `None` when the feed has permanently closed.
    async fn next_head(&mut self) -> Option<Head>;
}

/// Fallback [`HeadFeed`] that polls [`NodeClient::chain_head`] on a fixed
/// interval and emits a head whenever the reported number changes.
pub struct PollingHeadFeed {
    node: Arc<dyn NodeClient>,
    interval: Duration,
    last: Option<u64>,
}

impl PollingHeadFeed {
    pub fn new(node: Arc<dyn NodeClient>, interval: Duration) -> Self {
        Self {
            node,
            interval,
            last: None,
        }
    }
}

#[async_trait]
impl HeadFeed for PollingHeadFeed {
    async fn next_head(&mut self) -> Option<Head> {
        loop {
            tokio::time::sleep(self.interval).await;
            match self.node.chain_head().await {
                Ok(number) if self.last != Some(number) => {
                    self.last = Some(number);
                    return Some(Head { number, hash: None });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "failed to poll chain head");
                }
            }
        }
    }
}
