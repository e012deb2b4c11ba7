//! chainingest — pull blocks from an Ethereum-family node, persist them,
//! and re-publish them to subscribers.
//!
//! Configuration comes from the environment:
//!
//! ```bash
//! CHAININGEST_NODE_URL=http://localhost:8545 \
//! CHAININGEST_NODE_WS_URL=ws://localhost:8546 \
//! CHAININGEST_DATABASE_URL=postgres://localhost/chainingest \
//! CHAININGEST_MODE=persist+publish \
//! chainingest
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chainingest_core::bus::MemoryBus;
use chainingest_core::node::{HeadFeed, NodeClient, PollingHeadFeed};
use chainingest_core::store::{MemoryStore, Store};
use chainingest_core::{IngestConfig, IngestMode, Ingestor};
use chainingest_evm::{HttpNodeClient, WsHeadFeed};
use chainingest_storage::{PostgresStore, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config_from_env()?;

    let node: Arc<dyn NodeClient> = Arc::new(HttpNodeClient::new(&config.node_url));
    let store = open_store(&config).await?;
    let bus = Arc::new(MemoryBus::new());

    let head_feed: Box<dyn HeadFeed> = match &config.node_ws_url {
        Some(ws_url) => Box::new(WsHeadFeed::connect(ws_url)),
        None => Box::new(PollingHeadFeed::new(
            Arc::clone(&node),
            config.poll_interval(),
        )),
    };

    let cancel = CancellationToken::new();
    let ingestor = Ingestor::new(config, node, store, bus);

    spawn_progress_reporter(&ingestor, cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    ingestor.run(head_feed, cancel).await?;
    Ok(())
}

fn spawn_progress_reporter(ingestor: &Ingestor, cancel: CancellationToken) {
    let progress = ingestor.progress();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let snap = progress.snapshot();
                    info!(
                        blocks = snap.blocks_processed,
                        published = snap.blocks_published,
                        abandoned = snap.blocks_abandoned,
                        txs = snap.tx_count,
                        events = snap.event_count,
                        rate = format!("{:.2}/s", snap.blocks_per_sec()),
                        "sync progress"
                    );
                }
            }
        }
    });
}

fn config_from_env() -> Result<IngestConfig> {
    let mode = env_or("CHAININGEST_MODE", "persist")
        .parse::<IngestMode>()
        .map_err(|e| anyhow!("{e}"))?;
    let node_url =
        std::env::var("CHAININGEST_NODE_URL").context("CHAININGEST_NODE_URL is required")?;
    let database_url = std::env::var("CHAININGEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .unwrap_or_default();

    let mut builder = IngestConfig::builder()
        .mode(mode)
        .node_url(node_url)
        .database_url(database_url);

    if let Ok(ws_url) = std::env::var("CHAININGEST_NODE_WS_URL") {
        builder = builder.node_ws_url(ws_url);
    }
    if let Some(from_block) = env_parse::<u64>("CHAININGEST_FROM_BLOCK")? {
        builder = builder.from_block(from_block);
    }
    if let Some(factor) = env_parse::<usize>("CHAININGEST_CONCURRENCY_FACTOR")? {
        builder = builder.concurrency_factor(factor);
    }
    if let Some(tick) = env_parse::<u64>("CHAININGEST_RETRY_TICK_MS")? {
        builder = builder.retry_tick_ms(tick);
    }
    if let Some(batch) = env_parse::<usize>("CHAININGEST_RETRY_BATCH")? {
        builder = builder.retry_batch(batch);
    }
    if let Some(attempts) = env_parse::<u32>("CHAININGEST_MAX_ATTEMPTS")? {
        builder = builder.max_attempts(attempts);
    }
    if let Some(poll) = env_parse::<u64>("CHAININGEST_POLL_INTERVAL_MS")? {
        builder = builder.poll_interval_ms(poll);
    }
    if let Ok(path) = std::env::var("CHAININGEST_WATERMARK_PATH") {
        builder = builder.watermark_path(path);
    }

    Ok(builder.build()?)
}

async fn open_store(config: &IngestConfig) -> Result<Arc<dyn Store>> {
    let url = config.database_url.as_str();
    if url.is_empty() && !config.mode.persists() {
        // Publish-only without a database: nothing ever reaches the store.
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresStore::connect(url).await?))
    } else if url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::open(url).await?))
    } else if url == "memory" {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        bail!("unrecognized database url: {url}")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(None),
    }
}
