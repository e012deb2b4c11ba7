//! WebSocket newHeads feed.
//!
//! A background task owns the connection, subscribes to
//! `eth_subscribe("newHeads")`, and forwards each head to the feed. On
//! disconnect it reconnects with doubling backoff and re-subscribes. The
//! task exits when the feed is dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use chainingest_core::node::{Head, HeadFeed};

use crate::wire::parse_quantity;

const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// [`HeadFeed`] over a node WebSocket endpoint.
pub struct WsHeadFeed {
    rx: mpsc::UnboundedReceiver<Head>,
}

impl WsHeadFeed {
    /// Start the background connection task and return the feed.
    pub fn connect(url: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(ws_task(url.into(), tx));
        Self { rx }
    }
}

#[async_trait]
impl HeadFeed for WsHeadFeed {
    async fn next_head(&mut self) -> Option<Head> {
        self.rx.recv().await
    }
}

async fn ws_task(url: String, heads: mpsc::UnboundedSender<Head>) {
    let mut backoff = RECONNECT_INITIAL;

    loop {
        if heads.is_closed() {
            return;
        }
        info!(url = %url, "connecting head subscription");

        match tokio_tungstenite::connect_async(&url).await {
            Err(e) => {
                warn!(error = %e, "head subscription connect failed, retrying in {backoff:?}");
            }
            Ok((ws_stream, _)) => {
                backoff = RECONNECT_INITIAL;
                let (mut sink, mut stream) = ws_stream.split();

                let subscribe = serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "eth_subscribe",
                    "params": ["newHeads"],
                    "id": 1,
                });
                if sink.send(Message::Text(subscribe.to_string().into())).await.is_err() {
                    warn!("failed to send newHeads subscription");
                } else {
                    // Dispatch until the connection drops.
                    while let Some(msg) = stream.next().await {
                        if heads.is_closed() {
                            return;
                        }
                        match msg {
                            Ok(Message::Text(text)) => {
                                if let Some(head) = parse_head(text.as_str()) {
                                    debug!(number = head.number, "new head");
                                    if heads.send(head).is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "head subscription receive error");
                                break;
                            }
                        }
                    }
                }
                warn!(url = %url, "head subscription disconnected, reconnecting in {backoff:?}");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// Extract a head from an `eth_subscription` notification; anything else
/// (subscription confirmations, unrelated frames) yields `None`.
fn parse_head(text: &str) -> Option<Head> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("method")?.as_str()? != "eth_subscription" {
        return None;
    }
    let result = value.get("params")?.get("result")?;
    let number = parse_quantity(result.get("number")?.as_str()?).ok()?;
    let hash = result.get("hash")?.as_str()?.to_ascii_lowercase();
    Some(Head {
        number,
        hash: Some(hash),
    })
}
