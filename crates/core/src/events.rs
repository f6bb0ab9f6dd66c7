use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One oracle price observation, published on the price channel.
/// Delivered at-most-once per subscriber; consumers reconcile against
/// the store when they need a guaranteed view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub market_index: u16,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Live PnL delta for one position, fanned out to connected viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub position_id: Uuid,
    pub owner: String,
    pub unrealized_pnl: Decimal,
    pub pnl_pct: Decimal,
    pub current_ratio: Decimal,
    pub long_price: Decimal,
    pub short_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Heartbeat-channel message for venue connectivity state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub healthy: bool,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}
