//! HTTP JSON-RPC node client.
//!
//! A thin typed facade: no caching, no retry. Every failure is classified
//! at this boundary — transport problems and node-side errors come back as
//! transient, `null` results as not-found, undecodable bodies as malformed
//! — and the block processor decides what to do about it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use chainingest_core::error::NodeError;
use chainingest_core::node::NodeClient;
use chainingest_core::types::{FetchedBlock, Receipt};

use crate::wire::{parse_quantity, JsonRpcRequest, JsonRpcResponse, RawBlock, RawReceipt};

/// HTTP implementation of [`NodeClient`] backed by `reqwest`.
pub struct HttpNodeClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpNodeClient {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, NodeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| NodeError::Transient(format!("{method}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NodeError::Transient(format!("{method}: HTTP {status}")));
        }

        let rpc: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| NodeError::Malformed(format!("{method}: {e}")))?;

        match rpc.into_result() {
            Ok(value) => Ok(value),
            // Request-shape errors are ours and will not heal on retry.
            Err(err) if (-32602..=-32600).contains(&err.code) => {
                Err(NodeError::Malformed(format!("{method}: {err}")))
            }
            Err(err) => Err(NodeError::Transient(format!("{method}: {err}"))),
        }
    }

    async fn fetch_block(&self, method: &str, param: Value) -> Result<FetchedBlock, NodeError> {
        let value = self.call(method, vec![param, json!(true)]).await?;
        if value.is_null() {
            return Err(NodeError::NotFound);
        }
        let raw: RawBlock = serde_json::from_value(value)
            .map_err(|e| NodeError::Malformed(format!("{method}: {e}")))?;
        raw.into_fetched()
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn chain_head(&self) -> Result<u64, NodeError> {
        let value = self.call("eth_blockNumber", vec![]).await?;
        let quantity = value
            .as_str()
            .ok_or_else(|| NodeError::Malformed("eth_blockNumber: non-string result".into()))?;
        parse_quantity(quantity)
    }

    async fn block_by_number(&self, number: u64) -> Result<FetchedBlock, NodeError> {
        self.fetch_block("eth_getBlockByNumber", json!(format!("0x{number:x}")))
            .await
    }

    async fn block_by_hash(&self, hash: &str) -> Result<FetchedBlock, NodeError> {
        self.fetch_block("eth_getBlockByHash", json!(hash)).await
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Receipt, NodeError> {
        let value = self
            .call("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        if value.is_null() {
            return Err(NodeError::NotFound);
        }
        let raw: RawReceipt = serde_json::from_value(value)
            .map_err(|e| NodeError::Malformed(format!("eth_getTransactionReceipt: {e}")))?;
        raw.into_receipt()
    }

    async fn transaction_sender(&self, block_hash: &str, index: u32) -> Result<String, NodeError> {
        let value = self
            .call(
                "eth_getTransactionByBlockHashAndIndex",
                vec![json!(block_hash), json!(format!("0x{index:x}"))],
            )
            .await?;
        if value.is_null() {
            return Err(NodeError::NotFound);
        }
        let from = value
            .get("from")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::Malformed("transaction without sender".into()))?;
        Ok(from.to_ascii_lowercase())
    }
}
