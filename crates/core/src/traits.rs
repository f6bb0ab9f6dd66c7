use crate::margin::MarginRatios;
use crate::position::{CloseRecord, Position};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A live, subscribed session against the derivatives venue.
///
/// The venue is the source of truth for leg sizes, oracle prices, and
/// margin ratios; everything above this trait is venue-agnostic.
#[async_trait]
pub trait VenueSession: Send + Sync {
    async fn subscribe(&self) -> Result<()>;
    async fn unsubscribe(&self) -> Result<()>;
    /// One lightweight network round trip against the live connection.
    async fn probe(&self) -> Result<()>;
    /// Signed sizes of every leg the owner holds on the venue, keyed by
    /// market index. Near-zero means the venue considers that leg
    /// closed. One call serves all of an owner's positions, so sweeps
    /// cost O(owners) round trips, not O(positions).
    async fn leg_sizes(&self, owner: &str) -> Result<HashMap<u16, Decimal>>;
    async fn oracle_price(&self, market_index: u16) -> Result<Decimal>;
    async fn margin_ratios(&self, market_index: u16) -> Result<MarginRatios>;
}

/// Performs the expensive venue handshake and returns a ready session.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn VenueSession>>;
}

/// Hands out a ready session, typically from a cache.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn session(&self) -> Result<Arc<dyn VenueSession>>;
}

/// Persistence seam for positions. Close writes are conditional on the
/// current status so a double close is a reported no-op, never a second
/// record.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Open and partial positions the reconciliation sweep should look at.
    async fn sweep_candidates(&self) -> Result<Vec<Position>>;
    /// Open positions carrying a take-profit or stop-loss threshold.
    async fn open_with_triggers(&self) -> Result<Vec<Position>>;
    async fn open_for_owner(&self, owner: &str) -> Result<Vec<Position>>;
    async fn get(&self, id: Uuid) -> Result<Option<Position>>;
    async fn insert(&self, position: &Position) -> Result<()>;
    /// PARTIAL -> OPEN. Returns false if the position was no longer partial.
    async fn promote_partial(&self, id: Uuid) -> Result<bool>;
    /// OPEN -> CLOSED guarded by `status = OPEN`. Returns false if the
    /// position was already closed (idempotent close).
    async fn close_position(&self, id: Uuid, close: &CloseRecord) -> Result<bool>;
    /// PARTIAL -> CLOSED (cancelled). Returns false if not partial anymore.
    async fn cancel_partial(&self, id: Uuid, close: &CloseRecord) -> Result<bool>;
}
