//! SQLite storage backend.
//!
//! Single-file persistence with WAL mode for concurrent reads; foreign
//! keys are enabled per connection so the events → transactions →
//! blocks cascade actually fires.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::error;

use chainingest_core::error::IngestError;
use chainingest_core::store::Store;
use chainingest_core::types::{Block, Event, Transaction};

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    pub async fn open(path: &str) -> Result<Self, IngestError> {
        let path = path.strip_prefix("sqlite:").unwrap_or(path);
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| IngestError::Storage(format!("sqlite connect: {e}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database. All data is lost when the store is
    /// dropped; ideal for tests. The pool is capped at one connection —
    /// every in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self, IngestError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| IngestError::Storage(format!("sqlite options: {e}")))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| IngestError::Storage(format!("sqlite connect: {e}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// The underlying connection pool (for custom queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), IngestError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS blocks (
                hash              TEXT    PRIMARY KEY,
                number            INTEGER NOT NULL UNIQUE,
                time              INTEGER NOT NULL,
                parent_hash       TEXT    NOT NULL,
                difficulty        TEXT    NOT NULL,
                gas_used          INTEGER NOT NULL,
                gas_limit         INTEGER NOT NULL,
                nonce             TEXT    NOT NULL,
                miner             TEXT    NOT NULL,
                size              INTEGER NOT NULL,
                tx_root_hash      TEXT    NOT NULL,
                receipt_root_hash TEXT    NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS transactions (
                hash       TEXT     PRIMARY KEY,
                block_hash TEXT     NOT NULL REFERENCES blocks(hash) ON DELETE CASCADE,
                sender     TEXT     NOT NULL,
                recipient  TEXT     NOT NULL DEFAULT '',
                contract   TEXT     NOT NULL DEFAULT '',
                value      TEXT     NOT NULL,
                gas        INTEGER  NOT NULL,
                gas_price  TEXT     NOT NULL,
                cost       TEXT     NOT NULL,
                nonce      INTEGER  NOT NULL,
                state      INTEGER  NOT NULL,
                data       BLOB     NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_transactions_block_hash
             ON transactions(block_hash);",
            "CREATE TABLE IF NOT EXISTS events (
                tx_hash    TEXT    NOT NULL REFERENCES transactions(hash) ON DELETE CASCADE,
                log_index  INTEGER NOT NULL,
                origin     TEXT    NOT NULL,
                topics     TEXT    NOT NULL,
                data       BLOB    NOT NULL,
                block_hash TEXT    NOT NULL,
                PRIMARY KEY (tx_hash, log_index)
            );",
        ];
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| IngestError::Storage(format!("sqlite schema: {e}")))?;
        }
        Ok(())
    }

    async fn try_put_block(&self, block: &Block) -> sqlx::Result<()> {
        let mut txn = self.pool.begin().await?;

        // Reorg overwrite: a different hash at the same number replaces the
        // old row, and the cascade clears its transactions and events.
        let existing: Option<String> =
            sqlx::query_scalar("SELECT hash FROM blocks WHERE number = ?")
                .bind(block.number as i64)
                .fetch_optional(&mut *txn)
                .await?;
        if let Some(old_hash) = existing {
            if old_hash != block.hash {
                sqlx::query("DELETE FROM blocks WHERE hash = ?")
                    .bind(&old_hash)
                    .execute(&mut *txn)
                    .await?;
            }
        }

        sqlx::query(
            "INSERT INTO blocks
                (hash, number, time, parent_hash, difficulty, gas_used,
                 gas_limit, nonce, miner, size, tx_root_hash, receipt_root_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (hash) DO UPDATE SET
                number            = excluded.number,
                time              = excluded.time,
                parent_hash       = excluded.parent_hash,
                difficulty        = excluded.difficulty,
                gas_used          = excluded.gas_used,
                gas_limit         = excluded.gas_limit,
                nonce             = excluded.nonce,
                miner             = excluded.miner,
                size              = excluded.size,
                tx_root_hash      = excluded.tx_root_hash,
                receipt_root_hash = excluded.receipt_root_hash",
        )
        .bind(&block.hash)
        .bind(block.number as i64)
        .bind(block.time as i64)
        .bind(&block.parent_hash)
        .bind(&block.difficulty)
        .bind(block.gas_used as i64)
        .bind(block.gas_limit as i64)
        .bind(block.nonce.to_string())
        .bind(&block.miner)
        .bind(block.size as i64)
        .bind(&block.tx_root_hash)
        .bind(&block.receipt_root_hash)
        .execute(&mut *txn)
        .await?;

        txn.commit().await
    }

    async fn try_put_transaction(&self, tx: &Transaction) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO transactions
                (hash, block_hash, sender, recipient, contract, value,
                 gas, gas_price, cost, nonce, state, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (hash) DO UPDATE SET
                block_hash = excluded.block_hash,
                sender     = excluded.sender,
                recipient  = excluded.recipient,
                contract   = excluded.contract,
                value      = excluded.value,
                gas        = excluded.gas,
                gas_price  = excluded.gas_price,
                cost       = excluded.cost,
                nonce      = excluded.nonce,
                state      = excluded.state,
                data       = excluded.data",
        )
        .bind(&tx.hash)
        .bind(&tx.block_hash)
        .bind(&tx.from)
        .bind(&tx.to)
        .bind(&tx.contract)
        .bind(&tx.value)
        .bind(tx.gas as i64)
        .bind(&tx.gas_price)
        .bind(&tx.cost)
        .bind(tx.nonce as i64)
        .bind(tx.state as i64)
        .bind(&tx.data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_put_events(&self, events: &[Event]) -> sqlx::Result<()> {
        let mut txn = self.pool.begin().await?;
        for ev in events {
            // JSON array text; infallible for a list of strings.
            let topics = serde_json::Value::from(ev.topics.clone()).to_string();
            sqlx::query(
                "INSERT INTO events (tx_hash, log_index, origin, topics, data, block_hash)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (tx_hash, log_index) DO UPDATE SET
                    origin     = excluded.origin,
                    topics     = excluded.topics,
                    data       = excluded.data,
                    block_hash = excluded.block_hash",
            )
            .bind(&ev.tx_hash)
            .bind(ev.index as i64)
            .bind(&ev.origin)
            .bind(topics)
            .bind(&ev.data)
            .bind(&ev.block_hash)
            .execute(&mut *txn)
            .await?;
        }
        txn.commit().await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_block(&self, block: &Block) -> bool {
        match self.try_put_block(block).await {
            Ok(()) => true,
            Err(e) => {
                error!(number = block.number, hash = %block.hash, error = %e, "failed to persist block");
                false
            }
        }
    }

    async fn put_transaction(&self, tx: &Transaction) -> bool {
        match self.try_put_transaction(tx).await {
            Ok(()) => true,
            Err(e) => {
                error!(tx = %tx.hash, error = %e, "failed to persist transaction");
                false
            }
        }
    }

    async fn put_events(&self, events: &[Event]) -> bool {
        if events.is_empty() {
            return true;
        }
        match self.try_put_events(events).await {
            Ok(()) => true,
            Err(e) => {
                error!(tx = %events[0].tx_hash, error = %e, "failed to persist events");
                false
            }
        }
    }

    async fn last_indexed_number(&self) -> Option<u64> {
        match sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(number) FROM blocks")
            .fetch_one(&self.pool)
            .await
        {
            Ok(max) => max.map(|n| n as u64),
            Err(e) => {
                error!(error = %e, "failed to query last indexed number");
                None
            }
        }
    }

    async fn exists_block(&self, hash: &str) -> bool {
        match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM blocks WHERE hash = ?")
            .bind(hash)
            .fetch_one(&self.pool)
            .await
        {
            Ok(count) => count > 0,
            Err(e) => {
                error!(hash = %hash, error = %e, "failed to check block existence");
                false
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str) -> Block {
        Block {
            hash: hash.into(),
            number,
            time: 1_600_000_000 + number * 12,
            parent_hash: "0xparent".into(),
            difficulty: "1000".into(),
            gas_used: 21_000,
            gas_limit: 30_000_000,
            nonce: u64::MAX, // exercises the text encoding
            miner: "0xminer".into(),
            size: 640,
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
            value: "1000".into(),
            data: vec![0xca, 0xfe],
            gas: 21_000,
            gas_price: "2".into(),
            cost: "43000".into(),
            nonce: 1,
            state: 1,
            block_hash: block_hash.into(),
        }
    }

    fn event(tx_hash: &str, index: u32) -> Event {
        Event {
            origin: "0xorigin".into(),
            index,
            topics: vec!["0xtopic0".into(), "0xtopic1".into()],
            data: vec![1, 2, 3],
            tx_hash: tx_hash.into(),
            block_hash: "0xb1".into(),
        }
    }

    async fn count(store: &SqliteStore, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn block_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let b = block(100, "0xb1");
        assert!(store.put_block(&b).await);
        assert!(store.put_block(&b).await);
        assert_eq!(count(&store, "blocks").await, 1);
        assert_eq!(store.last_indexed_number().await, Some(100));
        assert!(store.exists_block("0xb1").await);
    }

    #[tokio::test]
    async fn transaction_then_events_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put_block(&block(1, "0xb1")).await;
        assert!(store.put_transaction(&tx("0xt1", "0xb1")).await);
        assert!(store.put_events(&[event("0xt1", 0), event("0xt1", 1)]).await);

        assert_eq!(count(&store, "transactions").await, 1);
        assert_eq!(count(&store, "events").await, 2);

        let topics: String =
            sqlx::query_scalar("SELECT topics FROM events WHERE tx_hash = '0xt1' AND log_index = 0")
                .fetch_one(store.pool())
                .await
                .unwrap();
        let decoded: Vec<String> = serde_json::from_str(&topics).unwrap();
        assert_eq!(decoded, vec!["0xtopic0", "0xtopic1"]);
    }

    #[tokio::test]
    async fn events_without_parent_fail() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put_block(&block(1, "0xb1")).await;
        // Foreign key violation — the boolean contract reports it as a
        // retryable failure.
        assert!(!store.put_events(&[event("0xmissing", 0)]).await);
        assert_eq!(count(&store, "events").await, 0);
    }

    #[tokio::test]
    async fn transaction_without_parent_block_fails() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(!store.put_transaction(&tx("0xt1", "0xmissing")).await);
    }

    #[tokio::test]
    async fn reorg_overwrite_cascades() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put_block(&block(100, "0xold")).await;
        store.put_transaction(&tx("0xt1", "0xold")).await;
        store.put_events(&[event("0xt1", 0)]).await;

        // Same number, different hash.
        assert!(store.put_block(&block(100, "0xnew")).await);

        assert_eq!(count(&store, "blocks").await, 1);
        assert_eq!(count(&store, "transactions").await, 0);
        assert_eq!(count(&store, "events").await, 0);
        assert!(store.exists_block("0xnew").await);
        assert!(!store.exists_block("0xold").await);
    }

    #[tokio::test]
    async fn resubmission_produces_identical_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        let b = block(7, "0xb7");
        let t = tx("0xt7", "0xb7");

        store.put_block(&b).await;
        store.put_transaction(&t).await;
        store.put_events(&[event("0xt7", 0)]).await;

        // Process the same block again.
        store.put_block(&b).await;
        store.put_transaction(&t).await;
        store.put_events(&[event("0xt7", 0)]).await;

        assert_eq!(count(&store, "blocks").await, 1);
        assert_eq!(count(&store, "transactions").await, 1);
        assert_eq!(count(&store, "events").await, 1);

        let (sender, cost): (String, String) =
            sqlx::query_as("SELECT sender, cost FROM transactions WHERE hash = '0xt7'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(sender, "0xsender");
        assert_eq!(cost, "43000");
    }

    #[tokio::test]
    async fn last_indexed_on_empty_store() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.last_indexed_number().await, None);
    }

    #[tokio::test]
    async fn block_nonce_survives_text_encoding() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put_block(&block(1, "0xb1")).await;
        let nonce: String = sqlx::query_scalar("SELECT nonce FROM blocks WHERE hash = '0xb1'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(nonce.parse::<u64>().unwrap(), u64::MAX);
    }
}
