//! Publish/subscribe distribution layer.
//!
//! One producer process holds the live venue subscription and publishes
//! price and PnL deltas; any number of delivery-tier processes
//! subscribe and re-broadcast to their own WebSocket clients, so
//! scaling the delivery tier never multiplies venue connections.
//!
//! Delivery is at-most-once with no replay. Consumers that need a
//! guaranteed view reconcile against the position store.

pub mod publisher;
pub mod subscriber;

pub use publisher::Publisher;
pub use subscriber::{BusMessage, Subscriber};

/// Oracle price and position PnL updates.
pub const PRICE_CHANNEL: &str = "pair-trade:prices";
/// Venue connectivity heartbeats.
pub const HEALTH_CHANNEL: &str = "pair-trade:health";
