//! Delivery-tier subscriber with bounded reconnection.
//!
//! Messages are forwarded into a local broadcast channel that the
//! WebSocket handlers tap. Losing the broker means serving no remote
//! updates until reconnected; it never crashes the node.

use anyhow::Result;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// A raw message off one of the logical channels.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Reconnect bookkeeping. The budget bounds consecutive failures
/// within one outage; a successful subscribe refills it, so a
/// long-lived node survives any number of transient broker outages.
struct RetryBudget {
    attempts: u32,
    max_attempts: u32,
}

impl RetryBudget {
    fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    fn refill(&mut self) {
        self.attempts = 0;
    }

    /// Backoff before the next attempt, or `None` once the budget for
    /// the current outage is spent.
    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.attempts.min(30))))
        }
    }
}

pub struct Subscriber {
    redis_url: String,
    channels: Vec<String>,
    max_reconnect_attempts: u32,
}

impl Subscriber {
    #[must_use]
    pub fn new(redis_url: &str, channels: Vec<String>, max_reconnect_attempts: u32) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            channels,
            max_reconnect_attempts,
        }
    }

    /// Consumes the configured channels until shutdown, forwarding each
    /// message into `tx`.
    ///
    /// Reconnects automatically with a bounded attempt budget per
    /// outage; the budget refills on every successful subscription.
    /// When one outage exhausts it the node keeps serving without
    /// remote updates and an operator has to restart it.
    pub async fn run(self, tx: broadcast::Sender<BusMessage>, mut shutdown: watch::Receiver<bool>) {
        let mut budget = RetryBudget::new(self.max_reconnect_attempts);

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.consume(&tx, &mut shutdown, &mut budget).await {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    let Some(backoff) = budget.next_backoff() else {
                        tracing::error!(
                            "giving up on redis after {} reconnect attempts: {}",
                            self.max_reconnect_attempts,
                            e
                        );
                        break;
                    };
                    tracing::warn!(
                        "redis subscription lost ({}), reconnecting in {:?}",
                        e,
                        backoff
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        tracing::debug!("subscriber stopped");
    }

    async fn consume(
        &self,
        tx: &broadcast::Sender<BusMessage>,
        shutdown: &mut watch::Receiver<bool>,
        budget: &mut RetryBudget,
    ) -> Result<()> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        for channel in &self.channels {
            pubsub.subscribe(channel).await?;
        }
        tracing::info!("subscribed to {:?}", self.channels);
        // Connected again: this outage is over.
        budget.refill();

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("redis message stream ended");
                    };
                    let channel = msg.get_channel_name().to_string();
                    match msg.get_payload::<String>() {
                        Ok(payload) => {
                            // No local listeners is fine; drop silently.
                            let _ = tx.send(BusMessage { channel, payload });
                        }
                        Err(e) => {
                            tracing::warn!("undecodable payload on {}: {}", channel, e);
                        }
                    }
                }
            }
        }
    }
}
