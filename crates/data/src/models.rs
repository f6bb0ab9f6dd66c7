//! Row-level representation of a position and its domain conversions.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use pair_trade_core::{
    CloseReason, CloseRecord, Leg, LegSide, PartialFill, Position, PositionStatus,
};
use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PositionRecord {
    pub id: Uuid,
    pub owner: String,
    pub long_symbol: String,
    pub long_market_index: i32,
    pub long_entry_price: Decimal,
    pub long_weight: Decimal,
    pub short_symbol: String,
    pub short_market_index: i32,
    pub short_entry_price: Decimal,
    pub short_weight: Decimal,
    pub entry_ratio: Decimal,
    pub capital: Decimal,
    pub leverage: i32,
    pub take_profit_ratio: Option<Decimal>,
    pub stop_loss_ratio: Option<Decimal>,
    pub status: String,
    pub pending_leg: Option<String>,
    pub long_fill_pct: Option<Decimal>,
    pub short_fill_pct: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_ratio: Option<Decimal>,
    pub close_long_price: Option<Decimal>,
    pub close_short_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub realized_pnl_pct: Option<Decimal>,
    pub close_reason: Option<String>,
}

pub(crate) fn status_to_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Partial => "PARTIAL",
        PositionStatus::Open => "OPEN",
        PositionStatus::Closed => "CLOSED",
    }
}

fn status_from_str(status: &str) -> Result<PositionStatus> {
    match status {
        "PARTIAL" => Ok(PositionStatus::Partial),
        "OPEN" => Ok(PositionStatus::Open),
        "CLOSED" => Ok(PositionStatus::Closed),
        other => Err(anyhow!("unknown position status: {other}")),
    }
}

pub(crate) fn reason_to_str(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::Reconciled => "reconciled",
        CloseReason::TakeProfit => "take_profit",
        CloseReason::StopLoss => "stop_loss",
        CloseReason::Manual => "manual",
        CloseReason::Cancelled => "cancelled",
    }
}

fn reason_from_str(reason: &str) -> Result<CloseReason> {
    match reason {
        "reconciled" => Ok(CloseReason::Reconciled),
        "take_profit" => Ok(CloseReason::TakeProfit),
        "stop_loss" => Ok(CloseReason::StopLoss),
        "manual" => Ok(CloseReason::Manual),
        "cancelled" => Ok(CloseReason::Cancelled),
        other => Err(anyhow!("unknown close reason: {other}")),
    }
}

fn leg_side_to_str(side: LegSide) -> &'static str {
    match side {
        LegSide::Long => "long",
        LegSide::Short => "short",
    }
}

fn leg_side_from_str(side: &str) -> Result<LegSide> {
    match side {
        "long" => Ok(LegSide::Long),
        "short" => Ok(LegSide::Short),
        other => Err(anyhow!("unknown leg side: {other}")),
    }
}

impl PositionRecord {
    #[must_use]
    pub fn from_position(position: &Position) -> Self {
        Self {
            id: position.id,
            owner: position.owner.clone(),
            long_symbol: position.long.symbol.clone(),
            long_market_index: i32::from(position.long.market_index),
            long_entry_price: position.long.entry_price,
            long_weight: position.long.weight,
            short_symbol: position.short.symbol.clone(),
            short_market_index: i32::from(position.short.market_index),
            short_entry_price: position.short.entry_price,
            short_weight: position.short.weight,
            entry_ratio: position.entry_ratio,
            capital: position.capital,
            leverage: position.leverage as i32,
            take_profit_ratio: position.take_profit_ratio,
            stop_loss_ratio: position.stop_loss_ratio,
            status: status_to_str(position.status).to_string(),
            pending_leg: position
                .partial
                .as_ref()
                .map(|p| leg_side_to_str(p.pending_leg).to_string()),
            long_fill_pct: position.partial.as_ref().map(|p| p.long_fill_pct),
            short_fill_pct: position.partial.as_ref().map(|p| p.short_fill_pct),
            opened_at: position.opened_at,
            closed_at: position.close.as_ref().map(|c| c.closed_at),
            close_ratio: position.close.as_ref().map(|c| c.close_ratio),
            close_long_price: position.close.as_ref().map(|c| c.close_long_price),
            close_short_price: position.close.as_ref().map(|c| c.close_short_price),
            realized_pnl: position.close.as_ref().map(|c| c.realized_pnl),
            realized_pnl_pct: position.close.as_ref().map(|c| c.realized_pnl_pct),
            close_reason: position
                .close
                .as_ref()
                .map(|c| reason_to_str(c.reason).to_string()),
        }
    }

    /// Converts a row back into the domain type.
    ///
    /// # Errors
    /// Returns an error if an enum column holds an unknown value or a
    /// market index is out of range.
    pub fn into_position(self) -> Result<Position> {
        let status = status_from_str(&self.status)?;

        let partial = match (self.pending_leg, self.long_fill_pct, self.short_fill_pct) {
            (Some(side), Some(long_fill_pct), Some(short_fill_pct)) => Some(PartialFill {
                pending_leg: leg_side_from_str(&side)?,
                long_fill_pct,
                short_fill_pct,
            }),
            _ => None,
        };

        let close = match (
            self.closed_at,
            self.close_ratio,
            self.close_long_price,
            self.close_short_price,
            self.realized_pnl,
            self.realized_pnl_pct,
            self.close_reason,
        ) {
            (
                Some(closed_at),
                Some(close_ratio),
                Some(close_long_price),
                Some(close_short_price),
                Some(realized_pnl),
                Some(realized_pnl_pct),
                Some(reason),
            ) => Some(CloseRecord {
                closed_at,
                close_ratio,
                close_long_price,
                close_short_price,
                realized_pnl,
                realized_pnl_pct,
                reason: reason_from_str(&reason)?,
            }),
            _ => None,
        };

        Ok(Position {
            id: self.id,
            owner: self.owner,
            long: Leg {
                symbol: self.long_symbol,
                market_index: u16::try_from(self.long_market_index)
                    .map_err(|_| anyhow!("long market index out of range"))?,
                entry_price: self.long_entry_price,
                weight: self.long_weight,
            },
            short: Leg {
                symbol: self.short_symbol,
                market_index: u16::try_from(self.short_market_index)
                    .map_err(|_| anyhow!("short market index out of range"))?,
                entry_price: self.short_entry_price,
                weight: self.short_weight,
            },
            entry_ratio: self.entry_ratio,
            capital: self.capital,
            leverage: u32::try_from(self.leverage)
                .ok()
                .filter(|l| *l > 0)
                .ok_or_else(|| anyhow!("leverage out of range: {}", self.leverage))?,
            take_profit_ratio: self.take_profit_ratio,
            stop_loss_ratio: self.stop_loss_ratio,
            status,
            partial,
            close,
            opened_at: self.opened_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_position() -> Position {
        Position::open(
            "alice".to_string(),
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
            Some(dec!(1.8)),
            None,
        )
        .unwrap()
    }

    #[test]
    fn record_conversion_preserves_open_position() {
        let position = sample_position();
        let roundtrip = PositionRecord::from_position(&position)
            .into_position()
            .unwrap();

        assert_eq!(roundtrip.id, position.id);
        assert_eq!(roundtrip.entry_ratio, dec!(1.5));
        assert_eq!(roundtrip.status, PositionStatus::Open);
        assert_eq!(roundtrip.take_profit_ratio, Some(dec!(1.8)));
        assert!(roundtrip.close.is_none());
    }

    #[test]
    fn record_conversion_preserves_partial_metadata() {
        let position = sample_position().with_partial_fill(PartialFill {
            pending_leg: LegSide::Short,
            long_fill_pct: dec!(100),
            short_fill_pct: dec!(0),
        });
        let roundtrip = PositionRecord::from_position(&position)
            .into_position()
            .unwrap();

        assert_eq!(roundtrip.status, PositionStatus::Partial);
        let partial = roundtrip.partial.unwrap();
        assert_eq!(partial.pending_leg, LegSide::Short);
        assert_eq!(partial.short_fill_pct, dec!(0));
    }

    #[test]
    fn nonpositive_leverage_is_rejected() {
        let mut record = PositionRecord::from_position(&sample_position());
        record.leverage = 0;
        assert!(record.clone().into_position().is_err());
        record.leverage = -3;
        assert!(record.into_position().is_err());
    }

    #[test]
    fn unknown_status_is_rejected() {
        let mut record = PositionRecord::from_position(&sample_position());
        record.status = "LIMBO".to_string();
        assert!(record.into_position().is_err());
    }
}
