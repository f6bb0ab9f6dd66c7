use crate::error::CalcError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Partial,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LegSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Venue closed the position off-cycle (liquidation, venue-side
    /// TP/SL, or a close made outside this system).
    Reconciled,
    TakeProfit,
    StopLoss,
    Manual,
    /// A partial fill that never completed and was unwound.
    Cancelled,
}

/// One side of a pair position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub symbol: String,
    pub market_index: u16,
    pub entry_price: Decimal,
    /// Fraction of capital allocated to this leg; the two legs sum to 1.
    pub weight: Decimal,
}

/// Fill state carried while exactly one leg is still pending on the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialFill {
    pub pending_leg: LegSide,
    pub long_fill_pct: Decimal,
    pub short_fill_pct: Decimal,
}

/// Everything recorded at the CLOSED transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRecord {
    pub closed_at: DateTime<Utc>,
    pub close_ratio: Decimal,
    pub close_long_price: Decimal,
    pub close_short_price: Decimal,
    pub realized_pnl: Decimal,
    pub realized_pnl_pct: Decimal,
    pub reason: CloseReason,
}

/// A leveraged two-legged pair position. The entry ratio is always
/// `long entry price / short entry price`; realized PnL is set exactly
/// once, at the CLOSED transition, and a closed position never reopens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub owner: String,
    pub long: Leg,
    pub short: Leg,
    pub entry_ratio: Decimal,
    pub capital: Decimal,
    pub leverage: u32,
    pub take_profit_ratio: Option<Decimal>,
    pub stop_loss_ratio: Option<Decimal>,
    pub status: PositionStatus,
    pub partial: Option<PartialFill>,
    pub close: Option<CloseRecord>,
    pub opened_at: DateTime<Utc>,
}

/// Price of the long leg divided by price of the short leg; the
/// quantity a pair trade speculates on.
///
/// # Errors
/// Returns `CalcError::InvalidInput` if the short price is zero or
/// either price is negative.
pub fn pair_ratio(long_price: Decimal, short_price: Decimal) -> Result<Decimal, CalcError> {
    if short_price <= Decimal::ZERO || long_price <= Decimal::ZERO {
        return Err(CalcError::InvalidInput(format!(
            "prices must be positive (long={long_price}, short={short_price})"
        )));
    }
    Ok(long_price / short_price)
}

impl Position {
    /// Creates a new position from an accepted two-leg order.
    ///
    /// The entry ratio is derived from the entry prices, never supplied
    /// by the caller, so the ratio invariant holds by construction.
    ///
    /// # Errors
    /// Returns `CalcError::InvalidInput` if capital or leverage is not
    /// positive, prices are not positive, or the leg weights do not sum to 1.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        owner: String,
        long: Leg,
        short: Leg,
        capital: Decimal,
        leverage: u32,
        take_profit_ratio: Option<Decimal>,
        stop_loss_ratio: Option<Decimal>,
    ) -> Result<Self, CalcError> {
        if capital <= Decimal::ZERO {
            return Err(CalcError::InvalidInput(format!(
                "capital must be positive, got {capital}"
            )));
        }
        if leverage == 0 {
            return Err(CalcError::InvalidInput("leverage must be at least 1".into()));
        }
        let weight_sum = long.weight + short.weight;
        if (weight_sum - Decimal::ONE).abs() > Decimal::new(1, 4) {
            return Err(CalcError::InvalidInput(format!(
                "leg weights must sum to 1, got {weight_sum}"
            )));
        }
        let entry_ratio = pair_ratio(long.entry_price, short.entry_price)?;

        Ok(Self {
            id: Uuid::new_v4(),
            owner,
            long,
            short,
            entry_ratio,
            capital,
            leverage,
            take_profit_ratio,
            stop_loss_ratio,
            status: PositionStatus::Open,
            partial: None,
            close: None,
            opened_at: Utc::now(),
        })
    }

    /// Marks a freshly created position as partially filled.
    #[must_use]
    pub fn with_partial_fill(mut self, partial: PartialFill) -> Self {
        self.status = PositionStatus::Partial;
        self.partial = Some(partial);
        self
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Unrealized PnL at the given ratio:
    /// `capital * leverage * (ratio - entry) / entry`.
    #[must_use]
    pub fn unrealized_pnl(&self, current_ratio: Decimal) -> Decimal {
        self.capital * Decimal::from(self.leverage) * (current_ratio - self.entry_ratio)
            / self.entry_ratio
    }

    /// Unrealized PnL as a percentage of committed capital.
    #[must_use]
    pub fn unrealized_pnl_pct(&self, current_ratio: Decimal) -> Decimal {
        self.unrealized_pnl(current_ratio) / self.capital * Decimal::ONE_HUNDRED
    }
}
