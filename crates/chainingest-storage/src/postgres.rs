//! PostgreSQL storage backend.
//!
//! Connection pooling via `sqlx::PgPool`; the schema is bootstrapped on
//! first connect. Logical schema:
//!
//! - `blocks` — PK `hash`, `UNIQUE (number)`
//! - `transactions` — PK `hash`, FK `block_hash → blocks` cascade,
//!   index on `block_hash`
//! - `events` — PK `(tx_hash, log_index)`, FK `tx_hash → transactions`
//!   cascade

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};

use chainingest_core::error::IngestError;
use chainingest_core::store::Store;
use chainingest_core::types::{Block, Event, Transaction};

/// Pool options for the Postgres backend.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_secs: 30,
        }
    }
}

/// PostgreSQL-backed [`Store`]. Cheaply cloneable — wraps a connection
/// pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and initialize the schema.
    pub async fn connect(database_url: &str) -> Result<Self, IngestError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, IngestError> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(opts.connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| IngestError::Storage(format!("postgres connect: {e}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("postgres store connected and schema initialized");
        Ok(store)
    }

    /// The underlying connection pool (for custom queries).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), IngestError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS blocks (
                hash              TEXT     PRIMARY KEY,
                number            BIGINT   NOT NULL UNIQUE,
                time              BIGINT   NOT NULL,
                parent_hash       TEXT     NOT NULL,
                difficulty        TEXT     NOT NULL,
                gas_used          BIGINT   NOT NULL,
                gas_limit         BIGINT   NOT NULL,
                nonce             TEXT     NOT NULL,
                miner             TEXT     NOT NULL,
                size              BIGINT   NOT NULL,
                tx_root_hash      TEXT     NOT NULL,
                receipt_root_hash TEXT     NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS transactions (
                hash       TEXT     PRIMARY KEY,
                block_hash TEXT     NOT NULL REFERENCES blocks(hash) ON DELETE CASCADE,
                sender     TEXT     NOT NULL,
                recipient  TEXT     NOT NULL DEFAULT '',
                contract   TEXT     NOT NULL DEFAULT '',
                value      TEXT     NOT NULL,
                gas        BIGINT   NOT NULL,
                gas_price  TEXT     NOT NULL,
                cost       TEXT     NOT NULL,
                nonce      BIGINT   NOT NULL,
                state      SMALLINT NOT NULL,
                data       BYTEA    NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_transactions_block_hash
             ON transactions(block_hash)",
            "CREATE TABLE IF NOT EXISTS events (
                tx_hash    TEXT   NOT NULL REFERENCES transactions(hash) ON DELETE CASCADE,
                log_index  BIGINT NOT NULL,
                origin     TEXT   NOT NULL,
                topics     TEXT   NOT NULL,
                data       BYTEA  NOT NULL,
                block_hash TEXT   NOT NULL,
                PRIMARY KEY (tx_hash, log_index)
            )",
        ];
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| IngestError::Storage(format!("postgres schema: {e}")))?;
        }
        Ok(())
    }

    async fn try_put_block(&self, block: &Block) -> sqlx::Result<()> {
        let mut txn = self.pool.begin().await?;

        // Reorg overwrite: delete the replaced row for this number and let
        // the cascade clear its transactions and events.
        let existing: Option<String> =
            sqlx::query_scalar("SELECT hash FROM blocks WHERE number = $1")
                .bind(block.number as i64)
                .fetch_optional(&mut *txn)
                .await?;
        if let Some(old_hash) = existing {
            if old_hash != block.hash {
                sqlx::query("DELETE FROM blocks WHERE hash = $1")
                    .bind(&old_hash)
                    .execute(&mut *txn)
                    .await?;
            }
        }

        sqlx::query(
            "INSERT INTO blocks
                (hash, number, time, parent_hash, difficulty, gas_used,
                 gas_limit, nonce, miner, size, tx_root_hash, receipt_root_hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (hash) DO UPDATE SET
                number            = EXCLUDED.number,
                time              = EXCLUDED.time,
                parent_hash       = EXCLUDED.parent_hash,
                difficulty        = EXCLUDED.difficulty,
                gas_used          = EXCLUDED.gas_used,
                gas_limit         = EXCLUDED.gas_limit,
                nonce             = EXCLUDED.nonce,
                miner             = EXCLUDED.miner,
                size              = EXCLUDED.size,
                tx_root_hash      = EXCLUDED.tx_root_hash,
                receipt_root_hash = EXCLUDED.receipt_root_hash",
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (hash) DO UPDATE SET
                block_hash = EXCLUDED.block_hash,
                sender     = EXCLUDED.sender,
                recipient  = EXCLUDED.recipient,
                contract   = EXCLUDED.contract,
                value      = EXCLUDED.value,
                gas        = EXCLUDED.gas,
                gas_price  = EXCLUDED.gas_price,
                cost       = EXCLUDED.cost,
                nonce      = EXCLUDED.nonce,
                state      = EXCLUDED.state,
                data       = EXCLUDED.data",
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
        .bind(tx.state as i16)
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
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (tx_hash, log_index) DO UPDATE SET
                    origin     = EXCLUDED.origin,
                    topics     = EXCLUDED.topics,
                    data       = EXCLUDED.data,
                    block_hash = EXCLUDED.block_hash",
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
impl Store for PostgresStore {
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
        match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM blocks WHERE hash = $1")
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
