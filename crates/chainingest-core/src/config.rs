//! Ingestor configuration.
//!
//! Built once at startup and passed into the orchestrator as an immutable
//! value; subcomponents read only the fields they need.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Operating discipline selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestMode {
    /// Write blocks, transactions, and events to the store only.
    Persist,
    /// Publish to the bus only; nothing is written to the store.
    Publish,
    /// Publish first, then persist. Persist failure triggers a retry;
    /// publish failure is logged and dropped.
    PersistAndPublish,
}

impl IngestMode {
    /// Returns `true` if this mode writes to the store.
    pub fn persists(&self) -> bool {
        matches!(self, Self::Persist | Self::PersistAndPublish)
    }

    /// Returns `true` if this mode publishes to the bus.
    pub fn publishes(&self) -> bool {
        matches!(self, Self::Publish | Self::PersistAndPublish)
    }
}

impl FromStr for IngestMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persist" => Ok(Self::Persist),
            "publish" => Ok(Self::Publish),
            "persist+publish" => Ok(Self::PersistAndPublish),
            other => Err(IngestError::Config(format!(
                "unknown mode '{other}' (expected persist, publish, or persist+publish)"
            ))),
        }
    }
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persist => write!(f, "persist"),
            Self::Publish => write!(f, "publish"),
            Self::PersistAndPublish => write!(f, "persist+publish"),
        }
    }
}

/// Configuration for an ingestor instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Operating mode.
    pub mode: IngestMode,
    /// HTTP JSON-RPC endpoint of the upstream node.
    pub node_url: String,
    /// Optional WebSocket endpoint; enables the newHeads subscription.
    /// When absent, the live phase polls `chain_head` instead.
    pub node_ws_url: Option<String>,
    /// Database DSN (`postgres://…`, `sqlite:…`, or `memory`).
    pub database_url: String,
    /// First block to index when the store is empty.
    pub from_block: u64,
    /// Multiplier on the CPU count for the per-block transaction worker pool.
    pub concurrency_factor: usize,
    /// Retry queue drain interval (milliseconds).
    pub retry_tick_ms: u64,
    /// Maximum numbers popped from the retry queue per tick.
    pub retry_batch: usize,
    /// Per-block attempt ceiling before the block is abandoned.
    pub max_attempts: u32,
    /// Chain-head polling interval when no head subscription is available
    /// (milliseconds).
    pub poll_interval_ms: u64,
    /// Path of the high-water-mark file driving back-fill in publish-only
    /// mode. `None` disables the mark.
    pub watermark_path: Option<PathBuf>,
}

impl IngestConfig {
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }

    /// Size of the per-block transaction worker pool:
    /// `available_parallelism × concurrency_factor`.
    pub fn worker_pool_size(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus * self.concurrency_factor).max(1)
    }

    pub fn retry_tick(&self) -> Duration {
        Duration::from_millis(self.retry_tick_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Fluent builder for [`IngestConfig`].
#[derive(Debug, Clone)]
pub struct IngestConfigBuilder {
    mode: IngestMode,
    node_url: String,
    node_ws_url: Option<String>,
    database_url: String,
    from_block: u64,
    concurrency_factor: usize,
    retry_tick_ms: u64,
    retry_batch: usize,
    max_attempts: u32,
    poll_interval_ms: u64,
    watermark_path: Option<PathBuf>,
}

impl Default for IngestConfigBuilder {
    fn default() -> Self {
        Self {
            mode: IngestMode::Persist,
            node_url: String::new(),
            node_ws_url: None,
            database_url: String::new(),
            from_block: 0,
            concurrency_factor: 1,
            retry_tick_ms: 1_000,
            retry_batch: 16,
            max_attempts: 10,
            poll_interval_ms: 1_000,
            watermark_path: None,
        }
    }
}

impl IngestConfigBuilder {
    pub fn mode(mut self, mode: IngestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn node_url(mut self, url: impl Into<String>) -> Self {
        self.node_url = url.into();
        self
    }

    pub fn node_ws_url(mut self, url: impl Into<String>) -> Self {
        self.node_ws_url = Some(url.into());
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn from_block(mut self, block: u64) -> Self {
        self.from_block = block;
        self
    }

    pub fn concurrency_factor(mut self, factor: usize) -> Self {
        self.concurrency_factor = factor;
        self
    }

    pub fn retry_tick_ms(mut self, ms: u64) -> Self {
        self.retry_tick_ms = ms;
        self
    }

    pub fn retry_batch(mut self, batch: usize) -> Self {
        self.retry_batch = batch;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn watermark_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.watermark_path = Some(path.into());
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        if self.node_url.is_empty() {
            return Err(IngestError::Config("node_url is required".into()));
        }
        if self.mode.persists() && self.database_url.is_empty() {
            return Err(IngestError::Config(format!(
                "database_url is required in mode '{}'",
                self.mode
            )));
        }
        if self.concurrency_factor == 0 {
            return Err(IngestError::Config(
                "concurrency_factor must be positive".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(IngestError::Config("max_attempts must be positive".into()));
        }
        Ok(IngestConfig {
            mode: self.mode,
            node_url: self.node_url,
            node_ws_url: self.node_ws_url,
            database_url: self.database_url,
            from_block: self.from_block,
            concurrency_factor: self.concurrency_factor,
            retry_tick_ms: self.retry_tick_ms,
            retry_batch: self.retry_batch,
            max_attempts: self.max_attempts,
            poll_interval_ms: self.poll_interval_ms,
            watermark_path: self.watermark_path,
        })
    }
}
