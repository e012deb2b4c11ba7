//! chainingest-evm — EVM node access for the ingestion core.
//!
//! - [`client::HttpNodeClient`] — HTTP JSON-RPC implementation of the
//!   core's `NodeClient` trait
//! - [`heads::WsHeadFeed`] — `eth_subscribe("newHeads")` over WebSocket
//!   with automatic reconnect
//! - [`wire`] — JSON-RPC 2.0 wire types and payload decoding

pub mod client;
pub mod heads;
pub mod wire;

pub use client::HttpNodeClient;
pub use heads::WsHeadFeed;
