//! The store seam: idempotent persistence of blocks, transactions, and
//! events.
//!
//! Every operation returns a boolean `persisted`; `false` means a retry is
//! warranted (connection lost, constraint violation, deadlock). Errors are
//! logged at the store boundary and never raised past it — the block
//! processor's control flow is driven by the booleans.
//!
//! Invariant: an event row is never visible without its parent transaction
//! row. Backends enforce it with a foreign key from events to transactions
//! (cascade on delete); the processor sequences the calls transaction
//! first, events second.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::error;

use crate::types::{Block, Event, Transaction};

/// Idempotent relational persistence.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert a block by hash. If a row with the same number but a different
    /// hash exists, it is overwritten and its transactions and events are
    /// cascade-deleted (reorg semantics).
    async fn put_block(&self, block: &Block) -> bool;

    /// Upsert a transaction by hash.
    async fn put_transaction(&self, tx: &Transaction) -> bool;

    /// Bulk upsert of the events of one receipt. Must be called after the
    /// parent transaction was persisted.
    async fn put_events(&self, events: &[Event]) -> bool;

    /// Highest block number present, or `None` for an empty store.
    async fn last_indexed_number(&self) -> Option<u64>;

    /// Membership check used to short-circuit re-fetches.
    async fn exists_block(&self, hash: &str) -> bool;
}

// ─── In-memory store ─────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryStoreInner {
    /// hash → block
    blocks: HashMap<String, Block>,
    /// number → hash
    by_number: HashMap<u64, String>,
    /// hash → transaction
    transactions: HashMap<String, Transaction>,
    /// (tx hash, log index) → event
    events: HashMap<(String, u32), Event>,
}

/// In-memory [`Store`] for tests and ephemeral runs. Mirrors the relational
/// backends' referential behavior, including the events → transactions
/// foreign key.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_by_number(&self, number: u64) -> Option<Block> {
        let inner = self.inner.lock().unwrap();
        let hash = inner.by_number.get(&number)?;
        inner.blocks.get(hash).cloned()
    }

    pub fn transaction(&self, hash: &str) -> Option<Transaction> {
        self.inner.lock().unwrap().transactions.get(hash).cloned()
    }

    /// Transactions referencing `block_hash`, in no particular order.
    pub fn transactions_for_block(&self, block_hash: &str) -> Vec<Transaction> {
        self.inner
            .lock()
            .unwrap()
            .transactions
            .values()
            .filter(|tx| tx.block_hash == block_hash)
            .cloned()
            .collect()
    }

    pub fn events_for_transaction(&self, tx_hash: &str) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .inner
            .lock()
            .unwrap()
            .events
            .values()
            .filter(|ev| ev.tx_hash == tx_hash)
            .cloned()
            .collect();
        events.sort_by_key(|ev| ev.index);
        events
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.lock().unwrap().transactions.len()
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }
}

impl MemoryStoreInner {
    /// Remove a block row and everything hanging off it.
    fn cascade_delete(&mut self, hash: &str) {
        self.blocks.remove(hash);
        let orphaned: Vec<String> = self
            .transactions
            .values()
            .filter(|tx| tx.block_hash == hash)
            .map(|tx| tx.hash.clone())
            .collect();
        for tx_hash in orphaned {
            self.transactions.remove(&tx_hash);
            self.events.retain(|(parent, _), _| parent != &tx_hash);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_block(&self, block: &Block) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old_hash) = inner.by_number.get(&block.number).cloned() {
            if old_hash != block.hash {
                // Reorg overwrite: drop the replaced chain segment.
                inner.cascade_delete(&old_hash);
            }
        }
        inner.by_number.insert(block.number, block.hash.clone());
        inner.blocks.insert(block.hash.clone(), block.clone());
        true
    }

    async fn put_transaction(&self, tx: &Transaction) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.blocks.contains_key(&tx.block_hash) {
            error!(
                tx = %tx.hash,
                block = %tx.block_hash,
                "failed to persist transaction: parent block missing"
            );
            return false;
        }
        inner.transactions.insert(tx.hash.clone(), tx.clone());
        true
    }

    async fn put_events(&self, events: &[Event]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        for ev in events {
            if !inner.transactions.contains_key(&ev.tx_hash) {
                error!(
                    tx = %ev.tx_hash,
                    index = ev.index,
                    "failed to persist event: parent transaction missing"
                );
                return false;
            }
        }
        for ev in events {
            inner
                .events
                .insert((ev.tx_hash.clone(), ev.index), ev.clone());
        }
        true
    }

    async fn last_indexed_number(&self) -> Option<u64> {
        self.inner.lock().unwrap().by_number.keys().max().copied()
    }

    async fn exists_block(&self, hash: &str) -> bool {
        self.inner.lock().unwrap().blocks.contains_key(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str) -> Block {
        Block {
            hash: hash.into(),
            number,
            time: number * 12,
            parent_hash: "0xparent".into(),
            difficulty: "1".into(),
            gas_used: 0,
            gas_limit: 30_000_000,
            nonce: 0,
            miner: "0xminer".into(),
            size: 500,
            tx_root_hash: "0xtxroot".into(),
            receipt_root_hash: "0xrcroot".into(),
        }
    }

    fn tx(hash: &str, block_hash: &str) -> Transaction {
        Transaction {
            hash: hash.into(),
            from: "0xsender".into(),
            to: "0xrecipient".into(),
            contract: String::new(),
            value: "0".into(),
            data: vec![],
            gas: 21_000,
            gas_price: "1".into(),
            cost: "21000".into(),
            nonce: 0,
            state: 1,
            block_hash: block_hash.into(),
        }
    }

    fn event(tx_hash: &str, index: u32) -> Event {
        Event {
            origin: "0xorigin".into(),
            index,
            topics: vec![],
            data: vec![],
            tx_hash: tx_hash.into(),
            block_hash: "0xb1".into(),
        }
    }

    #[tokio::test]
    async fn put_block_is_idempotent() {
        let store = MemoryStore::new();
        let b = block(100, "0xb1");
        assert!(store.put_block(&b).await);
        assert!(store.put_block(&b).await);
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.last_indexed_number().await, Some(100));
    }

    #[tokio::test]
    async fn reorg_overwrite_cascades() {
        let store = MemoryStore::new();
        store.put_block(&block(100, "0xold")).await;
        store.put_transaction(&tx("0xt1", "0xold")).await;
        store.put_events(&[event("0xt1", 0), event("0xt1", 1)]).await;

        // Same number, different hash: the old segment must vanish.
        assert!(store.put_block(&block(100, "0xnew")).await);
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.transaction_count(), 0);
        assert_eq!(store.event_count(), 0);
        assert!(store.exists_block("0xnew").await);
        assert!(!store.exists_block("0xold").await);
    }

    #[tokio::test]
    async fn events_require_parent_transaction() {
        let store = MemoryStore::new();
        store.put_block(&block(1, "0xb1")).await;
        // No parent transaction yet: constraint violation → false.
        assert!(!store.put_events(&[event("0xt1", 0)]).await);

        store.put_transaction(&tx("0xt1", "0xb1")).await;
        assert!(store.put_events(&[event("0xt1", 0)]).await);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn transaction_requires_parent_block() {
        let store = MemoryStore::new();
        assert!(!store.put_transaction(&tx("0xt1", "0xmissing")).await);
    }

    #[tokio::test]
    async fn last_indexed_is_highest() {
        let store = MemoryStore::new();
        assert_eq!(store.last_indexed_number().await, None);
        store.put_block(&block(5, "0xb5")).await;
        store.put_block(&block(3, "0xb3")).await;
        assert_eq!(store.last_indexed_number().await, Some(5));
    }
}
