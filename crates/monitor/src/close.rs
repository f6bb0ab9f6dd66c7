//! The one place a CLOSED transition is priced.
//!
//! The reconciliation worker, the TP/SL monitor, and the manual close
//! handler all go through `compute_close`, so realized PnL can never be
//! computed two different ways.

use chrono::Utc;
use pair_trade_core::{pair_ratio, CalcError, CloseReason, CloseRecord, Position};
use rust_decimal::Decimal;

/// Prices a close at the given oracle prices.
///
/// Realized PnL is
/// `capital * leverage * (close_ratio - entry_ratio) / entry_ratio`,
/// and the percentage is relative to committed capital.
///
/// # Errors
/// Returns `CalcError::InvalidInput` if either close price is not
/// positive or the position carries a non-positive entry ratio.
pub fn compute_close(
    position: &Position,
    long_price: Decimal,
    short_price: Decimal,
    reason: CloseReason,
) -> Result<CloseRecord, CalcError> {
    let close_ratio = pair_ratio(long_price, short_price)?;
    if position.entry_ratio <= Decimal::ZERO {
        return Err(CalcError::InvalidInput(format!(
            "entry ratio must be positive, got {}",
            position.entry_ratio
        )));
    }
    if position.capital <= Decimal::ZERO {
        return Err(CalcError::InvalidInput(format!(
            "capital must be positive, got {}",
            position.capital
        )));
    }

    let realized_pnl = position.capital
        * Decimal::from(position.leverage)
        * (close_ratio - position.entry_ratio)
        / position.entry_ratio;
    let realized_pnl_pct = realized_pnl / position.capital * Decimal::ONE_HUNDRED;

    Ok(CloseRecord {
        closed_at: Utc::now(),
        close_ratio,
        close_long_price: long_price,
        close_short_price: short_price,
        realized_pnl,
        realized_pnl_pct,
        reason,
    })
}

/// Close record for a partial fill that never completed: nothing was
/// ever at risk, so realized PnL is zero by definition.
///
/// # Errors
/// Returns `CalcError::InvalidInput` if either price is not positive.
pub fn cancelled_close(
    long_price: Decimal,
    short_price: Decimal,
) -> Result<CloseRecord, CalcError> {
    let close_ratio = pair_ratio(long_price, short_price)?;
    Ok(CloseRecord {
        closed_at: Utc::now(),
        close_ratio,
        close_long_price: long_price,
        close_short_price: short_price,
        realized_pnl: Decimal::ZERO,
        realized_pnl_pct: Decimal::ZERO,
        reason: CloseReason::Cancelled,
    })
}
