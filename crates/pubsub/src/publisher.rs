//! Best-effort publisher.
//!
//! A missing or broken broker must never take the producer down: every
//! failure is logged, the connection slot is cleared, and the next
//! publish retries the connect. Callers see an infallible API.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::RwLock;

pub struct Publisher {
    client: Option<redis::Client>,
    conn: RwLock<Option<MultiplexedConnection>>,
}

impl Publisher {
    /// Creates a publisher for the given Redis URL. The connection is
    /// established lazily on first publish.
    #[must_use]
    pub fn new(redis_url: &str) -> Self {
        let client = match redis::Client::open(redis_url) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("invalid redis url, running in local-only mode: {}", e);
                None
            }
        };
        Self {
            client,
            conn: RwLock::new(None),
        }
    }

    /// A publisher that never talks to a broker. Used in tests and in
    /// deployments without a delivery tier.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            client: None,
            conn: RwLock::new(None),
        }
    }

    async fn connection(&self) -> Option<MultiplexedConnection> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Some(conn);
        }
        let client = self.client.as_ref()?;
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                *self.conn.write().await = Some(conn.clone());
                tracing::info!("publisher connected to redis");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!("redis unreachable, publishing locally only: {}", e);
                None
            }
        }
    }

    /// Publishes a message to a channel. Never fails: publishing with
    /// no broker, no subscribers, or a broken connection is a logged
    /// no-op and the producer keeps running.
    pub async fn publish<T: Serialize>(&self, channel: &str, message: &T) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("failed to serialize message for {}: {}", channel, e);
                return;
            }
        };

        let Some(mut conn) = self.connection().await else {
            return;
        };

        let result: redis::RedisResult<i64> = conn.publish(channel, &payload).await;
        if let Err(e) = result {
            tracing::warn!("publish to {} failed, dropping connection: {}", channel, e);
            *self.conn.write().await = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pair_trade_core::PriceUpdate;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn disabled_publisher_accepts_messages_without_error() {
        let publisher = Publisher::disabled();
        for _ in 0..10 {
            publisher
                .publish(
                    crate::PRICE_CHANNEL,
                    &PriceUpdate {
                        market_index: 0,
                        price: Decimal::ONE,
                        timestamp: chrono::Utc::now(),
                    },
                )
                .await;
        }
    }

    #[tokio::test]
    async fn unreachable_broker_degrades_to_local_only() {
        // Nothing listens on this port; publish must log and return.
        let publisher = Publisher::new("redis://127.0.0.1:1/");
        publisher.publish(crate::HEALTH_CHANNEL, &"ping").await;
    }
}
