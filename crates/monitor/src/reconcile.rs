//! Reconciliation worker.
//!
//! The venue is ground truth. Positions close out there without this
//! system hearing about it: liquidations, venue-side TP/SL, closes made
//! from another client. Each sweep compares the local cache of open
//! positions against the venue's leg sizes and repairs the cache,
//! pricing the close from the venue's latest oracles.

use crate::close::{cancelled_close, compute_close};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pair_trade_core::{
    CloseReason, CloseRecord, PartialFill, Position, PositionStatus, PositionStore,
    PositionUpdate, SessionProvider, VenueSession,
};
use pair_trade_pubsub::{Publisher, PRICE_CHANNEL};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};

/// Summary of one sweep, cached for cheap status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepStats {
    pub checked: usize,
    pub closed: usize,
    pub promoted: usize,
    pub cancelled: usize,
    pub errors: usize,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Cloneable handle to the last sweep's stats; the status endpoint
/// reads this instead of re-querying the store.
#[derive(Clone, Default)]
pub struct StatusHandle {
    latest: Arc<RwLock<Option<SweepStats>>>,
}

impl StatusHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self) -> Option<SweepStats> {
        self.latest.read().await.clone()
    }

    async fn record(&self, stats: SweepStats) {
        *self.latest.write().await = Some(stats);
    }
}

pub struct ReconciliationWorker {
    store: Arc<dyn PositionStore>,
    venue: Arc<dyn SessionProvider>,
    publisher: Arc<Publisher>,
    status: StatusHandle,
    interval: std::time::Duration,
    grace_period: ChronoDuration,
    dust_threshold: Decimal,
}

enum Outcome {
    Untouched,
    Closed,
    Promoted,
    Cancelled,
}

impl ReconciliationWorker {
    #[must_use]
    pub fn new(
        store: Arc<dyn PositionStore>,
        venue: Arc<dyn SessionProvider>,
        publisher: Arc<Publisher>,
        interval: std::time::Duration,
        grace_period_secs: u64,
        dust_threshold: Decimal,
    ) -> Self {
        Self {
            store,
            venue,
            publisher,
            status: StatusHandle::new(),
            interval,
            grace_period: ChronoDuration::seconds(grace_period_secs as i64),
            dust_threshold,
        }
    }

    #[must_use]
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Runs sweeps on the configured interval until shutdown. A failed
    /// sweep is logged and never prevents the next scheduled one.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    match self.sweep_once().await {
                        Ok(stats) => {
                            tracing::info!(
                                "reconcile sweep: {} checked, {} closed, {} promoted, {} cancelled, {} errors in {}ms",
                                stats.checked, stats.closed, stats.promoted,
                                stats.cancelled, stats.errors, stats.duration_ms
                            );
                        }
                        Err(e) => tracing::error!("reconcile sweep failed: {:#}", e),
                    }
                }
            }
        }
        tracing::debug!("reconciliation worker stopped");
    }

    /// One full sweep over every open or partial position.
    ///
    /// Positions are grouped by owner so one venue fetch serves all of
    /// an owner's positions. Per-position failures are counted and the
    /// sweep continues.
    ///
    /// # Errors
    /// Returns an error only when the store or the venue session is
    /// unavailable before any position work starts; the next scheduled
    /// sweep retries.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let started = Instant::now();
        let positions = self
            .store
            .sweep_candidates()
            .await
            .context("failed to load sweep candidates")?;
        let session = self
            .venue
            .session()
            .await
            .context("failed to acquire venue session")?;

        let mut by_owner: BTreeMap<String, Vec<Position>> = BTreeMap::new();
        for position in positions {
            by_owner.entry(position.owner.clone()).or_default().push(position);
        }

        let mut stats = SweepStats {
            checked: 0,
            closed: 0,
            promoted: 0,
            cancelled: 0,
            errors: 0,
            duration_ms: 0,
            finished_at: Utc::now(),
        };
        let now = Utc::now();

        for (owner, positions) in by_owner {
            let leg_sizes = match session.leg_sizes(&owner).await {
                Ok(sizes) => sizes,
                Err(e) => {
                    tracing::warn!("skipping owner {}: venue fetch failed: {}", owner, e);
                    stats.errors += positions.len();
                    continue;
                }
            };

            for position in positions {
                if now - position.opened_at < self.grace_period {
                    // Could still be filling; don't race the order flow.
                    continue;
                }
                stats.checked += 1;

                let long_size = leg_sizes
                    .get(&position.long.market_index)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                let short_size = leg_sizes
                    .get(&position.short.market_index)
                    .copied()
                    .unwrap_or(Decimal::ZERO);

                let result = match position.status {
                    PositionStatus::Open => {
                        self.reconcile_open(session.as_ref(), &position, long_size, short_size)
                            .await
                    }
                    PositionStatus::Partial => {
                        self.reconcile_partial(session.as_ref(), &position, long_size, short_size)
                            .await
                    }
                    PositionStatus::Closed => Ok(Outcome::Untouched),
                };

                match result {
                    Ok(Outcome::Closed) => stats.closed += 1,
                    Ok(Outcome::Promoted) => stats.promoted += 1,
                    Ok(Outcome::Cancelled) => stats.cancelled += 1,
                    Ok(Outcome::Untouched) => {}
                    Err(e) => {
                        stats.errors += 1;
                        tracing::error!("reconcile failed for position {}: {:#}", position.id, e);
                    }
                }
            }
        }

        stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        stats.finished_at = Utc::now();
        self.status.record(stats.clone()).await;
        Ok(stats)
    }

    fn is_dust(&self, size: Decimal) -> bool {
        size.abs() < self.dust_threshold
    }

    async fn reconcile_open(
        &self,
        session: &dyn VenueSession,
        position: &Position,
        long_size: Decimal,
        short_size: Decimal,
    ) -> Result<Outcome> {
        if !self.is_dust(long_size) && !self.is_dust(short_size) {
            return Ok(Outcome::Untouched);
        }

        // Either leg gone on the venue means the position is closed
        // there; repair the cache from the venue's oracles.
        let long_price = session.oracle_price(position.long.market_index).await?;
        let short_price = session.oracle_price(position.short.market_index).await?;
        let close = compute_close(position, long_price, short_price, CloseReason::Reconciled)?;

        if self.store.close_position(position.id, &close).await? {
            tracing::info!(
                "closed position {} from venue state (pnl {})",
                position.id,
                close.realized_pnl
            );
            self.publish_close(position, &close).await;
            Ok(Outcome::Closed)
        } else {
            // Someone else won the close race; nothing to repair.
            tracing::debug!("position {} already closed, skipping", position.id);
            Ok(Outcome::Untouched)
        }
    }

    async fn reconcile_partial(
        &self,
        session: &dyn VenueSession,
        position: &Position,
        long_size: Decimal,
        short_size: Decimal,
    ) -> Result<Outcome> {
        let long_filled = !self.is_dust(long_size);
        let short_filled = !self.is_dust(short_size);

        match (long_filled, short_filled) {
            (true, true) => {
                if self.store.promote_partial(position.id).await? {
                    tracing::info!("position {} fully filled, promoted to open", position.id);
                    Ok(Outcome::Promoted)
                } else {
                    Ok(Outcome::Untouched)
                }
            }
            (false, false) => {
                // Both legs evaporated before completing; unwind.
                let long_price = session.oracle_price(position.long.market_index).await?;
                let short_price = session.oracle_price(position.short.market_index).await?;
                let close = cancelled_close(long_price, short_price)?;
                if self.store.cancel_partial(position.id, &close).await? {
                    tracing::info!("cancelled stuck partial position {}", position.id);
                    Ok(Outcome::Cancelled)
                } else {
                    Ok(Outcome::Untouched)
                }
            }
            (long_filled, _) => {
                // One leg filled: legitimate only while it matches the
                // recorded pending leg; anything else is ambiguous, so
                // log it and let a human look.
                if let Some(PartialFill { pending_leg, .. }) = &position.partial {
                    let consistent = match pending_leg {
                        pair_trade_core::LegSide::Long => !long_filled,
                        pair_trade_core::LegSide::Short => long_filled,
                    };
                    if !consistent {
                        tracing::warn!(
                            "position {} fill state disagrees with venue (pending {:?}), skipping",
                            position.id,
                            pending_leg
                        );
                    }
                }
                Ok(Outcome::Untouched)
            }
        }
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
    use crate::testutil::{FakeProvider, FakeVenue, MemoryStore};
    use pair_trade_core::{Leg, LegSide, PartialFill};
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn position(owner: &str) -> Position {
        let mut position = Position::open(
            owner.to_string(),
            Leg {
                symbol: "SOL-PERP".to_string(),
                market_index: 0,
                entry_price: dec!(150),
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
            None,
            None,
        )
        .unwrap();
        // Well past the grace period.
        position.opened_at = Utc::now() - ChronoDuration::minutes(10);
        position
    }

    fn worker(
        store: Arc<MemoryStore>,
        venue: Arc<FakeVenue>,
    ) -> ReconciliationWorker {
        ReconciliationWorker::new(
            store,
            Arc::new(FakeProvider { session: venue }),
            Arc::new(Publisher::disabled()),
            std::time::Duration::from_secs(30),
            300,
            dec!(0.001),
        )
    }

    #[tokio::test]
    async fn closes_position_the_venue_closed() {
        let position = position("alice");
        let id = position.id;
        let store = MemoryStore::with_positions(vec![position]);
        let venue = Arc::new(FakeVenue::default());
        venue.set_leg("alice", 0, dec!(0.0));
        venue.set_leg("alice", 2, dec!(12.3));
        venue.set_price(0, dec!(120));
        venue.set_price(2, dec!(100));

        let stats = worker(Arc::clone(&store), venue).sweep_once().await.unwrap();

        assert_eq!(stats.checked, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.errors, 0);

        let closed = store.snapshot(id);
        assert_eq!(closed.status, PositionStatus::Closed);
        let close = closed.close.unwrap();
        assert_eq!(close.reason, CloseReason::Reconciled);
        assert_eq!(close.close_ratio, dec!(1.2));
        assert_eq!(close.close_long_price, dec!(120));
        // 1000 * 5 * (1.2 - 1.5) / 1.5
        assert_eq!(close.realized_pnl, dec!(-1000));
    }

    #[tokio::test]
    async fn repeated_sweeps_close_exactly_once() {
        let position = position("alice");
        let id = position.id;
        let store = MemoryStore::with_positions(vec![position]);
        let venue = Arc::new(FakeVenue::default());
        venue.set_leg("alice", 0, dec!(0.0));
        venue.set_leg("alice", 2, dec!(12.3));
        venue.set_price(0, dec!(120));
        venue.set_price(2, dec!(100));

        let worker = worker(Arc::clone(&store), venue);
        let first = worker.sweep_once().await.unwrap();
        let first_pnl = store.snapshot(id).close.unwrap().realized_pnl;
        let second = worker.sweep_once().await.unwrap();

        assert_eq!(first.closed, 1);
        assert_eq!(second.closed, 0);
        assert_eq!(store.close_writes.load(Ordering::SeqCst), 1);
        assert_eq!(store.snapshot(id).close.unwrap().realized_pnl, first_pnl);
    }

    #[tokio::test]
    async fn positions_inside_grace_period_are_skipped() {
        let mut position = position("alice");
        position.opened_at = Utc::now();
        let id = position.id;
        let store = MemoryStore::with_positions(vec![position]);
        let venue = Arc::new(FakeVenue::default());
        // Venue says closed, but the order may still be filling.
        venue.set_leg("alice", 0, dec!(0.0));
        venue.set_leg("alice", 2, dec!(0.0));

        let stats = worker(Arc::clone(&store), venue).sweep_once().await.unwrap();

        assert_eq!(stats.checked, 0);
        assert_eq!(store.snapshot(id).status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn healthy_positions_stay_open() {
        let position = position("alice");
        let id = position.id;
        let store = MemoryStore::with_positions(vec![position]);
        let venue = Arc::new(FakeVenue::default());
        venue.set_leg("alice", 0, dec!(5.5));
        venue.set_leg("alice", 2, dec!(-8.2));

        let stats = worker(Arc::clone(&store), venue).sweep_once().await.unwrap();

        assert_eq!(stats.closed, 0);
        assert_eq!(store.snapshot(id).status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn fully_filled_partial_is_promoted() {
        let partial = position("alice").with_partial_fill(PartialFill {
            pending_leg: LegSide::Short,
            long_fill_pct: dec!(100),
            short_fill_pct: dec!(0),
        });
        let id = partial.id;
        let store = MemoryStore::with_positions(vec![partial]);
        let venue = Arc::new(FakeVenue::default());
        venue.set_leg("alice", 0, dec!(5.5));
        venue.set_leg("alice", 2, dec!(-8.2));

        let stats = worker(Arc::clone(&store), venue).sweep_once().await.unwrap();

        assert_eq!(stats.promoted, 1);
        assert_eq!(store.snapshot(id).status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn stuck_partial_with_no_fills_is_cancelled() {
        let partial = position("alice").with_partial_fill(PartialFill {
            pending_leg: LegSide::Short,
            long_fill_pct: dec!(0),
            short_fill_pct: dec!(0),
        });
        let id = partial.id;
        let store = MemoryStore::with_positions(vec![partial]);
        let venue = Arc::new(FakeVenue::default());
        venue.set_price(0, dec!(140));
        venue.set_price(2, dec!(100));

        let stats = worker(Arc::clone(&store), venue).sweep_once().await.unwrap();

        assert_eq!(stats.cancelled, 1);
        let closed = store.snapshot(id);
        assert_eq!(closed.status, PositionStatus::Closed);
        let close = closed.close.unwrap();
        assert_eq!(close.reason, CloseReason::Cancelled);
        assert_eq!(close.realized_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn one_owner_failing_does_not_stop_the_sweep() {
        let broken = position("mallory");
        let healthy = position("alice");
        let healthy_id = healthy.id;
        let store = MemoryStore::with_positions(vec![broken, healthy]);
        let venue = Arc::new(FakeVenue::default());
        venue.fail_owner("mallory");
        venue.set_leg("alice", 0, dec!(0.0));
        venue.set_leg("alice", 2, dec!(12.3));
        venue.set_price(0, dec!(120));
        venue.set_price(2, dec!(100));

        let stats = worker(Arc::clone(&store), venue).sweep_once().await.unwrap();

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(store.snapshot(healthy_id).status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn status_handle_caches_latest_sweep() {
        let store = MemoryStore::with_positions(Vec::new());
        let venue = Arc::new(FakeVenue::default());
        let worker = worker(store, venue);
        let status = worker.status_handle();

        assert!(status.latest().await.is_none());
        worker.sweep_once().await.unwrap();
        let stats = status.latest().await.unwrap();
        assert_eq!(stats.checked, 0);
    }
}
