//! Canonical records and node-side payload shapes.
//!
//! The serde names on [`Block`], [`Transaction`], and [`Event`] are the
//! pub/sub payload contract: camelCase keys, `0x`-prefixed lower-case hex
//! for hashes and addresses, decimal strings for big integers.

use serde::{Deserialize, Serialize};

// ─── Canonical records ───────────────────────────────────────────────────────

/// A block as persisted and published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub number: u64,
    /// UNIX timestamp, seconds.
    pub time: u64,
    #[serde(rename = "parentHash")]
    pub parent_hash: String,
    /// Arbitrary-precision integer rendered as a decimal string.
    pub difficulty: String,
    #[serde(rename = "gasUsed")]
    pub gas_used: u64,
    #[serde(rename = "gasLimit")]
    pub gas_limit: u64,
    pub nonce: u64,
    pub miner: String,
    /// Encoded size in bytes.
    pub size: u64,
    #[serde(rename = "txRootHash")]
    pub tx_root_hash: String,
    #[serde(rename = "receiptRootHash")]
    pub receipt_root_hash: String,
}

/// A transaction as persisted and published.
///
/// Exactly one of `to` / `contract` is non-empty: `contract` carries the
/// created contract's address for contract-creation transactions, `to` the
/// recipient for everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub contract: String,
    pub value: String,
    /// Raw input data; published as `0x…` hex or the empty string.
    #[serde(with = "hex_data")]
    pub data: Vec<u8>,
    pub gas: u64,
    #[serde(rename = "gasPrice")]
    pub gas_price: String,
    pub cost: String,
    pub nonce: u64,
    /// 0 = failed, 1 = succeeded.
    pub state: u8,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
}

impl Transaction {
    /// Returns `true` if this transaction created a contract.
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_empty()
    }

    /// The `(to set) XOR (contract set)` invariant.
    pub fn has_exclusive_recipient(&self) -> bool {
        self.to.is_empty() != self.contract.is_empty()
    }
}

/// An event log as persisted and published. Identified by
/// `(tx_hash, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub origin: String,
    pub index: u32,
    /// 0–4 topic hashes, in order.
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    #[serde(rename = "txHash")]
    pub tx_hash: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
}

// ─── Node-side shapes ────────────────────────────────────────────────────────

/// A block as fetched from the node: the canonical header record plus the
/// transaction bodies it carries, in consensus order.
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    pub block: Block,
    pub txs: Vec<TxBody>,
}

/// A transaction body as embedded in a fetched block. `to == None` marks a
/// contract creation; the created address comes from the receipt.
#[derive(Debug, Clone)]
pub struct TxBody {
    pub hash: String,
    pub to: Option<String>,
    pub value: u128,
    pub gas: u64,
    pub gas_price: u128,
    pub nonce: u64,
    pub input: Vec<u8>,
}

/// The post-execution artifact for a transaction.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_hash: String,
    /// 0 = failed, 1 = succeeded.
    pub status: u8,
    /// Created contract address, if any.
    pub contract_address: Option<String>,
    pub transaction_index: u32,
    pub logs: Vec<LogEntry>,
}

/// A single log entry from a receipt.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub address: String,
    /// Log index within the block.
    pub index: u32,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
}

/// A fully-fetched transaction: the canonical record plus its events,
/// assembled by a tx worker from `(body, sender, receipt)`.
#[derive(Debug, Clone)]
pub struct PackedTransaction {
    pub transaction: Transaction,
    pub events: Vec<Event>,
}

impl PackedTransaction {
    /// Assemble the canonical record from the node-side pieces.
    ///
    /// `cost = value + gas_price × gas`; the created contract address is
    /// recorded only when the body carries no recipient.
    pub fn pack(body: &TxBody, sender: &str, receipt: &Receipt) -> Self {
        let (to, contract) = match &body.to {
            Some(to) => (to.clone(), String::new()),
            None => (
                String::new(),
                receipt.contract_address.clone().unwrap_or_default(),
            ),
        };
        let cost = body
            .value
            .saturating_add(body.gas_price.saturating_mul(u128::from(body.gas)));

        let transaction = Transaction {
            hash: body.hash.clone(),
            from: sender.to_string(),
            to,
            contract,
            value: body.value.to_string(),
            data: body.input.clone(),
            gas: body.gas,
            gas_price: body.gas_price.to_string(),
            cost: cost.to_string(),
            nonce: body.nonce,
            state: receipt.status,
            block_hash: receipt.block_hash.clone(),
        };

        let events = receipt
            .logs
            .iter()
            .map(|log| Event {
                origin: log.address.clone(),
                index: log.index,
                topics: log.topics.clone(),
                data: log.data.clone(),
                tx_hash: receipt.tx_hash.clone(),
                block_hash: receipt.block_hash.clone(),
            })
            .collect();

        Self { transaction, events }
    }
}

// ─── Hex helpers ─────────────────────────────────────────────────────────────

/// Encode bytes as `0x`-prefixed lower-case hex.
pub fn encode_hex(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(2 + data.len() * 2);
    out.push_str("0x");
    for byte in data {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Decode a hex string (with or without `0x`) into bytes.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.len() % 2 != 0 {
        return Err(format!("odd-length hex string: {s}"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("invalid hex at offset {i}: {e}"))
        })
        .collect()
}

/// Serde adapter: `Vec<u8>` as `0x…` hex, or the empty string for no data.
mod hex_data {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        if data.is_empty() {
            ser.serialize_str("")
        } else {
            ser.serialize_str(&super::encode_hex(data))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        super::decode_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
