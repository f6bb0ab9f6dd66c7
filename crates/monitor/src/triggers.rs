//! Take-profit / stop-loss monitor.
//!
//! Compares the live cross-leg ratio against stored thresholds and
//! closes positions whose trigger fired. Runs independently of the
//! reconciliation sweep but prices closes through the same engine.

use crate::close::compute_close;
use crate::notify::Notifier;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pair_trade_core::{
    pair_ratio, CloseReason, CloseRecord, Position, PositionStore, PositionUpdate,
    SessionProvider, VenueSession,
};
use pair_trade_pubsub::{Publisher, PRICE_CHANNEL};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerStats {
    pub evaluated: usize,
    pub triggered: usize,
    pub errors: usize,
    pub finished_at: DateTime<Utc>,
}

/// Decides whether a threshold fired at the given ratio.
///
/// Take-profit is evaluated first and wins ties: if a price gap crosses
/// both thresholds in one cycle, the close is recorded as TakeProfit.
#[must_use]
pub fn evaluate_trigger(
    take_profit_ratio: Option<Decimal>,
    stop_loss_ratio: Option<Decimal>,
    current_ratio: Decimal,
) -> Option<CloseReason> {
    if let Some(tp) = take_profit_ratio {
        if current_ratio >= tp {
            return Some(CloseReason::TakeProfit);
        }
    }
    if let Some(sl) = stop_loss_ratio {
        if current_ratio <= sl {
            return Some(CloseReason::StopLoss);
        }
    }
    None
}

pub struct TpSlMonitor {
    store: Arc<dyn PositionStore>,
    venue: Arc<dyn SessionProvider>,
    publisher: Arc<Publisher>,
    notifier: Arc<dyn Notifier>,
    interval: std::time::Duration,
}

impl TpSlMonitor {
    #[must_use]
    pub fn new(
        store: Arc<dyn PositionStore>,
        venue: Arc<dyn SessionProvider>,
        publisher: Arc<Publisher>,
        notifier: Arc<dyn Notifier>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            venue,
            publisher,
            notifier,
            interval,
        }
    }

    /// Evaluates triggers on the configured interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    match self.check_once().await {
                        Ok(stats) => {
                            if stats.triggered > 0 || stats.errors > 0 {
                                tracing::info!(
                                    "trigger check: {} evaluated, {} triggered, {} errors",
                                    stats.evaluated, stats.triggered, stats.errors
                                );
                            }
                        }
                        Err(e) => tracing::error!("trigger check failed: {:#}", e),
                    }
                }
            }
        }
        tracing::debug!("tp/sl monitor stopped");
    }

    /// One pass over every open position carrying a threshold.
    ///
    /// # Errors
    /// Returns an error only when the store or venue session is
    /// unavailable; per-position failures are counted and skipped.
    pub async fn check_once(&self) -> Result<TriggerStats> {
        let positions = self
            .store
            .open_with_triggers()
            .await
            .context("failed to load positions with triggers")?;
        let session = self
            .venue
            .session()
            .await
            .context("failed to acquire venue session")?;

        let mut stats = TriggerStats {
            evaluated: 0,
            triggered: 0,
            errors: 0,
            finished_at: Utc::now(),
        };

        for position in positions {
            stats.evaluated += 1;
            match self.check_position(session.as_ref(), &position).await {
                Ok(true) => stats.triggered += 1,
                Ok(false) => {}
                Err(e) => {
                    stats.errors += 1;
                    tracing::error!("trigger check failed for {}: {:#}", position.id, e);
                }
            }
        }

        stats.finished_at = Utc::now();
        Ok(stats)
    }

    async fn check_position(
        &self,
        session: &dyn VenueSession,
        position: &Position,
    ) -> Result<bool> {
        let long_price = session.oracle_price(position.long.market_index).await?;
        let short_price = session.oracle_price(position.short.market_index).await?;
        let current_ratio = pair_ratio(long_price, short_price)?;

        let Some(reason) = evaluate_trigger(
            position.take_profit_ratio,
            position.stop_loss_ratio,
            current_ratio,
        ) else {
            return Ok(false);
        };

        let close = compute_close(position, long_price, short_price, reason)?;
        if !self.store.close_position(position.id, &close).await? {
            // Lost the race to the reconciler or a manual close.
            tracing::debug!("position {} already closed before trigger", position.id);
            return Ok(false);
        }

        tracing::info!(
            "position {} closed by {:?} at ratio {} (pnl {})",
            position.id,
            reason,
            current_ratio,
            close.realized_pnl
        );
        self.publish_close(position, &close).await;

        // The close is committed; a lost notification stays lost.
        let message = format!(
            "pair position {} closed ({:?}), realized pnl {}",
            position.id, reason, close.realized_pnl
        );
        if let Err(e) = self.notifier.notify(&position.owner, &message).await {
            tracing::warn!("notification for {} failed: {}", position.id, e);
        }

        Ok(true)
    }

    async fn publish_close(&self, position: &Position, close: &CloseRecord) {
        let update = PositionUpdate {
            position_id: position.id,
            owner: position.owner.clone(),
            unrealized_pnl: close.realized_pnl,
            pnl_pct: close.realized_pnl_pct,
            current_ratio: close.close_ratio,
            long_price: close.close_long_price,
            short_price: close.close_short_price,
            timestamp: close.closed_at,
        };
        self.publisher.publish(PRICE_CHANNEL, &update).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::testutil::{FakeProvider, FakeVenue, MemoryStore};
    use async_trait::async_trait;
    use pair_trade_core::{Leg, PositionStatus};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingNotifier {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _owner: &str, _message: &str) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("webhook down")
        }
    }

    fn position(
        take_profit_ratio: Option<Decimal>,
        stop_loss_ratio: Option<Decimal>,
    ) -> Position {
        Position::open(
            "alice".to_string(),
            Leg {
                symbol: "SOL-PERP".to_string(),
                market_index: 0,
                entry_price: dec!(100),
                weight: dec!(0.5),
            },
            Leg {
                symbol: "ETH-PERP".to_string(),
                market_index: 2,
                entry_price: dec!(100),
                weight: dec!(0.5),
            },
            dec!(1000),
            5,
            take_profit_ratio,
            stop_loss_ratio,
        )
        .unwrap()
    }

    fn monitor(
        store: Arc<MemoryStore>,
        venue: Arc<FakeVenue>,
        notifier: Arc<dyn Notifier>,
    ) -> TpSlMonitor {
        TpSlMonitor::new(
            store,
            Arc::new(FakeProvider { session: venue }),
            Arc::new(Publisher::disabled()),
            notifier,
            std::time::Duration::from_secs(30),
        )
    }

    #[test]
    fn take_profit_wins_when_price_gaps_across_both() {
        let reason = evaluate_trigger(Some(dec!(1.2)), Some(dec!(1.3)), dec!(1.25));
        assert_eq!(reason, Some(CloseReason::TakeProfit));
    }

    #[test]
    fn no_trigger_between_thresholds() {
        assert_eq!(evaluate_trigger(Some(dec!(1.2)), Some(dec!(0.9)), dec!(1.0)), None);
        assert_eq!(evaluate_trigger(None, None, dec!(1.0)), None);
    }

    #[tokio::test]
    async fn take_profit_closes_above_threshold() {
        let position = position(Some(dec!(1.2)), None);
        let id = position.id;
        let store = MemoryStore::with_positions(vec![position]);
        let venue = Arc::new(FakeVenue::default());
        venue.set_price(0, dec!(125));
        venue.set_price(2, dec!(100));

        let stats = monitor(Arc::clone(&store), venue, Arc::new(crate::LogNotifier))
            .check_once()
            .await
            .unwrap();

        assert_eq!(stats.triggered, 1);
        let closed = store.snapshot(id);
        assert_eq!(closed.status, PositionStatus::Closed);
        let close = closed.close.unwrap();
        assert_eq!(close.reason, CloseReason::TakeProfit);
        // 1000 * 5 * (1.25 - 1.0) / 1.0
        assert_eq!(close.realized_pnl, dec!(1250));
    }

    #[tokio::test]
    async fn stop_loss_closes_below_threshold() {
        let position = position(None, Some(dec!(0.9)));
        let id = position.id;
        let store = MemoryStore::with_positions(vec![position]);
        let venue = Arc::new(FakeVenue::default());
        venue.set_price(0, dec!(85));
        venue.set_price(2, dec!(100));

        let stats = monitor(Arc::clone(&store), venue, Arc::new(crate::LogNotifier))
            .check_once()
            .await
            .unwrap();

        assert_eq!(stats.triggered, 1);
        let close = store.snapshot(id).close.unwrap();
        assert_eq!(close.reason, CloseReason::StopLoss);
    }

    #[tokio::test]
    async fn untriggered_position_stays_open() {
        let position = position(Some(dec!(1.2)), Some(dec!(0.9)));
        let id = position.id;
        let store = MemoryStore::with_positions(vec![position]);
        let venue = Arc::new(FakeVenue::default());
        venue.set_price(0, dec!(100));
        venue.set_price(2, dec!(100));

        let stats = monitor(Arc::clone(&store), venue, Arc::new(crate::LogNotifier))
            .check_once()
            .await
            .unwrap();

        assert_eq!(stats.triggered, 0);
        assert_eq!(store.snapshot(id).status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn notification_failure_does_not_undo_the_close() {
        let position = position(Some(dec!(1.2)), None);
        let id = position.id;
        let store = MemoryStore::with_positions(vec![position]);
        let venue = Arc::new(FakeVenue::default());
        venue.set_price(0, dec!(125));
        venue.set_price(2, dec!(100));
        let notifier = Arc::new(FailingNotifier {
            attempts: AtomicUsize::new(0),
        });

        let stats = monitor(Arc::clone(&store), venue, Arc::clone(&notifier) as Arc<dyn Notifier>)
            .check_once()
            .await
            .unwrap();

        assert_eq!(stats.triggered, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(notifier.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(store.snapshot(id).status, PositionStatus::Closed);
    }
}
