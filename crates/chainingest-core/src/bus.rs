//! The bus seam: named-topic pub/sub, the durable retry queue, and the
//! per-block attempt counter — three surfaces over one backing substrate.
//!
//! Publication is fire-and-forget; loss is acceptable because the store is
//! the source of truth. The retry queue and attempt counter carry the
//! bounded-retry bookkeeping for the whole pipeline. The bus is the only
//! component that touches the queue/pub-sub substrate; everything else
//! goes through this trait.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

/// Topic carrying block payloads.
pub const TOPIC_BLOCK: &str = "block";
/// Topic carrying transaction payloads.
pub const TOPIC_TRANSACTION: &str = "transaction";
/// Topic carrying event payloads.
pub const TOPIC_EVENT: &str = "event";

/// Pub/sub, retry queue, and attempt counter.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Best-effort publication of a JSON payload to a named topic.
    /// Returns `false` on substrate failure; the caller logs and moves on.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> bool;

    /// Append a block number to the retry queue. O(1); duplicates allowed.
    async fn push_retry(&self, number: u64);

    /// Pop the oldest queued block number, if any.
    async fn pop_retry(&self) -> Option<u64>;

    /// Current retry queue length.
    async fn retry_len(&self) -> usize;

    /// Current attempt count for a block number (0 when unset).
    async fn attempts(&self, number: u64) -> u32;

    /// Atomically increment and return the attempt count for a number.
    async fn bump_attempts(&self, number: u64) -> u32;

    /// Delete the attempt counter for a number (clean success or terminal
    /// failure).
    async fn clear_attempts(&self, number: u64);

    /// Subscribe to a topic. Receivers observe payloads published after the
    /// call, JSON-encoded.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<String>;
}

/// In-process [`Bus`] over tokio broadcast channels.
///
/// Subscribers that fall behind lose the oldest messages (broadcast lag),
/// which matches the best-effort delivery contract.
pub struct MemoryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    retry: Mutex<VecDeque<u64>>,
    attempts: Mutex<HashMap<u64, u32>>,
    capacity: usize,
}

impl MemoryBus {
    /// Default per-topic channel capacity.
    const DEFAULT_CAPACITY: usize = 1_024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            retry: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> bool {
        // A send error just means nobody is subscribed right now; that is
        // fine for fire-and-forget delivery.
        let _ = self.sender(topic).send(payload.to_string());
        true
    }

    async fn push_retry(&self, number: u64) {
        self.retry.lock().unwrap().push_back(number);
        debug!(number, "pushed block into retry queue");
    }

    async fn pop_retry(&self) -> Option<u64> {
        self.retry.lock().unwrap().pop_front()
    }

    async fn retry_len(&self) -> usize {
        self.retry.lock().unwrap().len()
    }

    async fn attempts(&self, number: u64) -> u32 {
        self.attempts.lock().unwrap().get(&number).copied().unwrap_or(0)
    }

    async fn bump_attempts(&self, number: u64) -> u32 {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(number).or_insert(0);
        *count += 1;
        *count
    }

    async fn clear_attempts(&self, number: u64) {
        self.attempts.lock().unwrap().remove(&number);
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender(topic).subscribe()
    }
}
