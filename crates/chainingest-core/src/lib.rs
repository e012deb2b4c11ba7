//! chainingest-core — the ingestion core of the chainingest indexer.
//!
//! Turns a stream of block identifiers into durably-stored, fan-out-published,
//! gap-free records. The pipeline is built from injected collaborators:
//!
//! - [`node::NodeClient`] — typed read-only JSON-RPC facade
//! - [`store::Store`] — idempotent relational persistence
//! - [`bus::Bus`] — named-topic pub/sub plus the retry queue and attempt map
//! - [`lock::ProcessQueueLock`] — one in-flight worker per block number
//! - [`processor::BlockProcessor`] — per-block fetch / persist / publish
//! - [`retry::RetryManager`] — bounded re-submission of failed blocks
//! - [`sync::Synchronizer`] — back-fill and live head following
//!
//! All references point downward from [`pipeline::Ingestor`]; no component
//! holds a reference back up the stack.

pub mod bus;
pub mod config;
pub mod error;
pub mod lock;
pub mod node;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod retry;
pub mod store;
pub mod sync;
pub mod types;
pub mod watermark;

pub use config::{IngestConfig, IngestConfigBuilder, IngestMode};
pub use error::{IngestError, NodeError};
pub use pipeline::Ingestor;
