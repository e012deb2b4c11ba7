//! JSON-RPC 2.0 wire types and EVM payload decoding.
//!
//! Raw shapes mirror the node's camelCase JSON; conversion into the core
//! records normalizes hex to `0x`-prefixed lower-case and renders big
//! integers as decimal strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainingest_core::error::NodeError;
use chainingest_core::types::{decode_hex, Block, FetchedBlock, LogEntry, Receipt, TxBody};

// ─── JSON-RPC 2.0 ────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Unwrap the result value or return the node's error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

// ─── Quantity helpers ────────────────────────────────────────────────────────

/// Parse a hex quantity (`"0x1b4"`) into a u64.
pub fn parse_quantity(s: &str) -> Result<u64, NodeError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| NodeError::Malformed(format!("bad quantity '{s}': {e}")))
}

/// Parse a hex quantity into a u128 (values, gas prices, difficulty).
pub fn parse_quantity_u128(s: &str) -> Result<u128, NodeError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u128::from_str_radix(digits, 16)
        .map_err(|e| NodeError::Malformed(format!("bad quantity '{s}': {e}")))
}

fn lowercase_hex(s: &str) -> String {
    s.to_ascii_lowercase()
}

// ─── Raw node payloads ───────────────────────────────────────────────────────

/// A block as returned by `eth_getBlockByNumber` / `eth_getBlockByHash`
/// with full transaction objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub hash: String,
    pub number: String,
    pub parent_hash: String,
    pub timestamp: String,
    #[serde(default)]
    pub difficulty: Option<String>,
    pub gas_used: String,
    pub gas_limit: String,
    /// Absent on some post-merge chains.
    #[serde(default)]
    pub nonce: Option<String>,
    pub miner: String,
    pub size: String,
    pub transactions_root: String,
    pub receipts_root: String,
    #[serde(default)]
    pub transactions: Vec<RawTx>,
}

/// A transaction object embedded in a raw block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTx {
    pub hash: String,
    /// `null` marks a contract creation.
    #[serde(default)]
    pub to: Option<String>,
    pub value: String,
    pub gas: String,
    #[serde(default)]
    pub gas_price: Option<String>,
    pub nonce: String,
    pub input: String,
}

/// A receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReceipt {
    pub transaction_hash: String,
    pub block_hash: String,
    /// Absent on pre-Byzantium receipts.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub contract_address: Option<String>,
    pub transaction_index: String,
    #[serde(default)]
    pub logs: Vec<RawLog>,
}

/// A log entry embedded in a raw receipt.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub data: String,
    pub log_index: String,
}

// ─── Conversions ─────────────────────────────────────────────────────────────

impl RawBlock {
    pub fn into_fetched(self) -> Result<FetchedBlock, NodeError> {
        let block = Block {
            hash: lowercase_hex(&self.hash),
            number: parse_quantity(&self.number)?,
            time: parse_quantity(&self.timestamp)?,
            parent_hash: lowercase_hex(&self.parent_hash),
            difficulty: self
                .difficulty
                .as_deref()
                .map(parse_quantity_u128)
                .transpose()?
                .unwrap_or(0)
                .to_string(),
            gas_used: parse_quantity(&self.gas_used)?,
            gas_limit: parse_quantity(&self.gas_limit)?,
            nonce: self
                .nonce
                .as_deref()
                .map(parse_quantity)
                .transpose()?
                .unwrap_or(0),
            miner: lowercase_hex(&self.miner),
            size: parse_quantity(&self.size)?,
            tx_root_hash: lowercase_hex(&self.transactions_root),
            receipt_root_hash: lowercase_hex(&self.receipts_root),
        };
        let txs = self
            .transactions
            .into_iter()
            .map(RawTx::into_body)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FetchedBlock { block, txs })
    }
}

impl RawTx {
    fn into_body(self) -> Result<TxBody, NodeError> {
        Ok(TxBody {
            hash: lowercase_hex(&self.hash),
            to: self.to.as_deref().map(lowercase_hex),
            value: parse_quantity_u128(&self.value)?,
            gas: parse_quantity(&self.gas)?,
            gas_price: self
                .gas_price
                .as_deref()
                .map(parse_quantity_u128)
                .transpose()?
                .unwrap_or(0),
            nonce: parse_quantity(&self.nonce)?,
            input: decode_hex(&self.input).map_err(NodeError::Malformed)?,
        })
    }
}

impl RawReceipt {
    pub fn into_receipt(self) -> Result<Receipt, NodeError> {
        let status = match self.status.as_deref() {
            Some(s) => (parse_quantity(s)? != 0) as u8,
            // Pre-Byzantium receipts carry no status field.
            None => 1,
        };
        let logs = self
            .logs
            .into_iter()
            .map(RawLog::into_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Receipt {
            tx_hash: lowercase_hex(&self.transaction_hash),
            block_hash: lowercase_hex(&self.block_hash),
            status,
            contract_address: self.contract_address.as_deref().map(lowercase_hex),
            transaction_index: parse_quantity(&self.transaction_index)? as u32,
            logs,
        })
    }
}

impl RawLog {
    fn into_entry(self) -> Result<LogEntry, NodeError> {
        Ok(LogEntry {
            address: lowercase_hex(&self.address),
            index: parse_quantity(&self.log_index)? as u32,
            topics: self.topics.iter().map(|t| lowercase_hex(t)).collect(),
            data: decode_hex(&self.data).map_err(NodeError::Malformed)?,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
