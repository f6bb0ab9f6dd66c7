//! Margin, liquidation, and health math for pair positions.
//!
//! Pure and deterministic: all market data arrives as arguments, so the
//! same numbers feed the delivery tier, the reconciliation worker, and
//! the TP/SL monitor.

use crate::error::CalcError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Initial/maintenance margin ratios for one market.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarginRatios {
    pub initial: Decimal,
    pub maintenance: Decimal,
}

impl MarginRatios {
    /// Fallback estimate used when the venue's per-market ratios are
    /// unavailable: 11% initial, 5.5% maintenance.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            initial: Decimal::new(11, 2),
            maintenance: Decimal::new(55, 3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarginInputs {
    pub capital: Decimal,
    pub leverage: Decimal,
    pub entry_ratio: Decimal,
    /// Fractions of capital per leg; must sum to 1.
    pub long_weight: Decimal,
    pub short_weight: Decimal,
    /// `None` falls back to `MarginRatios::fallback()`.
    pub long_ratios: Option<MarginRatios>,
    pub short_ratios: Option<MarginRatios>,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginSummary {
    pub initial_margin: Decimal,
    pub maintenance_margin: Decimal,
    /// Ratio at which collateral meets the maintenance requirement.
    pub liquidation_ratio: Decimal,
    /// Distance to liquidation in [0, 100]. 0 means collateral already
    /// at or below the maintenance requirement: the caller must treat
    /// this as a close trigger, not an error.
    pub health: Decimal,
}

/// Computes margin requirements, the liquidation ratio, and health.
///
/// Notional per leg is `capital * leverage * weight`; the liquidation
/// ratio solves for the ratio move at which collateral equals the
/// maintenance requirement.
///
/// # Errors
/// Returns `CalcError::InvalidInput` when capital, leverage, or the
/// entry ratio is not positive, or the leg weights do not sum to 1.
pub fn compute_margin(inputs: &MarginInputs) -> Result<MarginSummary, CalcError> {
    if inputs.capital <= Decimal::ZERO {
        return Err(CalcError::InvalidInput(format!(
            "capital must be positive, got {}",
            inputs.capital
        )));
    }
    if inputs.leverage <= Decimal::ZERO {
        return Err(CalcError::InvalidInput(format!(
            "leverage must be positive, got {}",
            inputs.leverage
        )));
    }
    if inputs.entry_ratio <= Decimal::ZERO {
        return Err(CalcError::InvalidInput(format!(
            "entry ratio must be positive, got {}",
            inputs.entry_ratio
        )));
    }
    let weight_sum = inputs.long_weight + inputs.short_weight;
    if (weight_sum - Decimal::ONE).abs() > Decimal::new(1, 4) {
        return Err(CalcError::InvalidInput(format!(
            "leg weights must sum to 1, got {weight_sum}"
        )));
    }

    let long_ratios = inputs.long_ratios.unwrap_or_else(MarginRatios::fallback);
    let short_ratios = inputs.short_ratios.unwrap_or_else(MarginRatios::fallback);

    let exposure = inputs.capital * inputs.leverage;
    let long_notional = exposure * inputs.long_weight;
    let short_notional = exposure * inputs.short_weight;

    let initial_margin =
        long_notional * long_ratios.initial + short_notional * short_ratios.initial;
    let maintenance_margin =
        long_notional * long_ratios.maintenance + short_notional * short_ratios.maintenance;

    // Ratio move at which capital + PnL hits the maintenance requirement.
    let delta = (maintenance_margin - inputs.capital) / exposure;
    let liquidation_ratio = inputs.entry_ratio * (Decimal::ONE + delta);

    let collateral = inputs.capital + inputs.unrealized_pnl;
    let health = if collateral <= Decimal::ZERO {
        // Already liquidated; terminal, never negative.
        Decimal::ZERO
    } else {
        (Decimal::ONE_HUNDRED * (Decimal::ONE - maintenance_margin / collateral))
            .clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
    };

    Ok(MarginSummary {
        initial_margin,
        maintenance_margin,
        liquidation_ratio,
        health,
    })
}
