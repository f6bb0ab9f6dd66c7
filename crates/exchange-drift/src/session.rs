//! A subscribed Drift session: REST client plus a live market WebSocket.
//!
//! Establishing one of these is the expensive handshake the connection
//! manager amortizes: TCP + TLS + subscription + a snapshot round trip,
//! typically 2-5 seconds against mainnet. A spawned read loop drains
//! the socket, decodes oracle price frames into `PriceUpdate`s, and
//! keeps tungstenite answering the venue's pings.

use crate::client::DriftClient;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pair_trade_core::{MarginRatios, PriceUpdate, SessionFactory, VenueSession};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Deserialize)]
struct PriceFrame {
    channel: String,
    data: PriceFrameData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFrameData {
    market_index: u16,
    price: Decimal,
}

fn decode_price_frame(text: &str) -> Option<PriceUpdate> {
    let frame: PriceFrame = serde_json::from_str(text).ok()?;
    if frame.channel != "oraclePrices" {
        return None;
    }
    Some(PriceUpdate {
        market_index: frame.data.market_index,
        price: frame.data.price,
        timestamp: Utc::now(),
    })
}

fn spawn_read_loop(
    mut stream: SplitStream<WsStream>,
    prices: broadcast::Sender<PriceUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if let Some(update) = decode_price_frame(&text) {
                        // No local listeners is fine.
                        let _ = prices.send(update);
                    }
                }
                // Reading is what lets tungstenite answer server pings.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
                Ok(Message::Close(_)) => {
                    tracing::warn!("drift websocket closed by venue");
                    break;
                }
                Err(e) => {
                    tracing::warn!("drift websocket read failed: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("drift websocket read loop stopped");
    })
}

pub struct DriftSession {
    client: DriftClient,
    sink: Mutex<WsSink>,
    subscribed: AtomicBool,
    read_task: JoinHandle<()>,
}

impl DriftSession {
    async fn send(&self, payload: serde_json::Value) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(payload.to_string())).await?;
        Ok(())
    }
}

impl Drop for DriftSession {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

#[async_trait]
impl VenueSession for DriftSession {
    async fn subscribe(&self) -> Result<()> {
        self.send(serde_json::json!({
            "type": "subscribe",
            "channel": "oraclePrices",
        }))
        .await?;
        self.subscribed.store(true, Ordering::SeqCst);
        tracing::debug!("subscribed to drift oracle price channel");
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        if !self.subscribed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.send(serde_json::json!({
            "type": "unsubscribe",
            "channel": "oraclePrices",
        }))
        .await
    }

    async fn probe(&self) -> Result<()> {
        // A ping frame exercises the live socket; a broken connection
        // fails here rather than on the next user-facing request.
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| anyhow!("venue probe failed: {e}"))?;
        sink.flush().await.map_err(|e| anyhow!("venue probe failed: {e}"))?;
        Ok(())
    }

    async fn leg_sizes(&self, owner: &str) -> Result<HashMap<u16, Decimal>> {
        self.client.leg_sizes(owner).await
    }

    async fn oracle_price(&self, market_index: u16) -> Result<Decimal> {
        self.client.oracle_price(market_index).await
    }

    async fn margin_ratios(&self, market_index: u16) -> Result<MarginRatios> {
        self.client.margin_ratios(market_index).await
    }
}

pub struct DriftSessionFactory {
    api_url: String,
    ws_url: String,
    prices: broadcast::Sender<PriceUpdate>,
}

impl DriftSessionFactory {
    #[must_use]
    pub fn new(api_url: String, ws_url: String) -> Self {
        let (prices, _) = broadcast::channel(256);
        Self {
            api_url,
            ws_url,
            prices,
        }
    }

    /// Live oracle price feed from whichever session is currently
    /// subscribed. Survives session refreshes; the runner publishes
    /// these onto the price channel.
    #[must_use]
    pub fn price_feed(&self) -> broadcast::Receiver<PriceUpdate> {
        self.prices.subscribe()
    }
}

#[async_trait]
impl SessionFactory for DriftSessionFactory {
    async fn connect(&self) -> Result<Arc<dyn VenueSession>> {
        tracing::debug!("connecting drift session to {}", self.ws_url);

        let client = DriftClient::new(self.api_url.clone());
        // Validate the REST side before paying for the socket.
        client.health().await?;

        let (stream, response) = connect_async(&self.ws_url).await.map_err(|e| {
            anyhow!("failed to connect to drift websocket at {}: {e}", self.ws_url)
        })?;
        tracing::info!(
            "drift websocket connected to {} (HTTP status: {})",
            self.ws_url,
            response.status()
        );

        let (sink, read) = stream.split();
        let read_task = spawn_read_loop(read, self.prices.clone());

        let session = Arc::new(DriftSession {
            client,
            sink: Mutex::new(sink),
            subscribed: AtomicBool::new(false),
            read_task,
        });
        session.subscribe().await?;

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn decodes_oracle_price_frames() {
        let update = decode_price_frame(
            r#"{"channel":"oraclePrices","data":{"marketIndex":2,"price":"98.5"}}"#,
        )
        .unwrap();
        assert_eq!(update.market_index, 2);
        assert_eq!(update.price, dec!(98.5));
    }

    #[test]
    fn ignores_other_channels_and_noise() {
        assert!(decode_price_frame(
            r#"{"channel":"heartbeat","data":{"marketIndex":0,"price":"1"}}"#
        )
        .is_none());
        assert!(decode_price_frame("not json").is_none());
        assert!(decode_price_frame(r#"{"channel":"oraclePrices"}"#).is_none());
    }
}
