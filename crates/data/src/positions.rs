//! Position repository.
//!
//! Close transitions are conditional UPDATEs guarded by the current
//! status, a row-level compare-and-swap: the reconciliation worker, the
//! TP/SL monitor, and a manual close can race, and exactly one of them
//! wins the CLOSED write.

use crate::models::{reason_to_str, PositionRecord};
use anyhow::Result;
use async_trait::async_trait;
use pair_trade_core::{CloseRecord, Position, PositionStore};
use sqlx::PgPool;
use uuid::Uuid;

const SELECT_COLUMNS: &str = r"
    id, owner, long_symbol, long_market_index, long_entry_price, long_weight,
    short_symbol, short_market_index, short_entry_price, short_weight,
    entry_ratio, capital, leverage, take_profit_ratio, stop_loss_ratio,
    status, pending_leg, long_fill_pct, short_fill_pct, opened_at,
    closed_at, close_ratio, close_long_price, close_short_price,
    realized_pnl, realized_pnl_pct, close_reason";

#[derive(Clone)]
pub struct PositionRepository {
    pool: PgPool,
}

impl PositionRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the positions table and its (owner, status) index.
    ///
    /// # Errors
    /// Returns an error if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS positions (
                id UUID PRIMARY KEY,
                owner TEXT NOT NULL,
                long_symbol TEXT NOT NULL,
                long_market_index INT NOT NULL,
                long_entry_price NUMERIC NOT NULL,
                long_weight NUMERIC NOT NULL,
                short_symbol TEXT NOT NULL,
                short_market_index INT NOT NULL,
                short_entry_price NUMERIC NOT NULL,
                short_weight NUMERIC NOT NULL,
                entry_ratio NUMERIC NOT NULL,
                capital NUMERIC NOT NULL,
                leverage INT NOT NULL,
                take_profit_ratio NUMERIC,
                stop_loss_ratio NUMERIC,
                status TEXT NOT NULL,
                pending_leg TEXT,
                long_fill_pct NUMERIC,
                short_fill_pct NUMERIC,
                opened_at TIMESTAMPTZ NOT NULL,
                closed_at TIMESTAMPTZ,
                close_ratio NUMERIC,
                close_long_price NUMERIC,
                close_short_price NUMERIC,
                realized_pnl NUMERIC,
                realized_pnl_pct NUMERIC,
                close_reason TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_positions_owner_status
            ON positions (owner, status)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_where(&self, clause: &str, owner: Option<&str>) -> Result<Vec<Position>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM positions WHERE {clause} ORDER BY opened_at ASC");
        let mut query = sqlx::query_as::<_, PositionRecord>(&sql);
        if let Some(owner) = owner {
            query = query.bind(owner.to_string());
        }
        let records = query.fetch_all(&self.pool).await?;
        records.into_iter().map(PositionRecord::into_position).collect()
    }
}

#[async_trait]
impl PositionStore for PositionRepository {
    async fn sweep_candidates(&self) -> Result<Vec<Position>> {
        self.fetch_where("status IN ('OPEN', 'PARTIAL')", None).await
    }

    async fn open_with_triggers(&self) -> Result<Vec<Position>> {
        self.fetch_where(
            "status = 'OPEN' AND (take_profit_ratio IS NOT NULL OR stop_loss_ratio IS NOT NULL)",
            None,
        )
        .await
    }

    async fn open_for_owner(&self, owner: &str) -> Result<Vec<Position>> {
        self.fetch_where("owner = $1 AND status = 'OPEN'", Some(owner))
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM positions WHERE id = $1");
        let record = sqlx::query_as::<_, PositionRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        record.map(PositionRecord::into_position).transpose()
    }

    async fn insert(&self, position: &Position) -> Result<()> {
        let record = PositionRecord::from_position(position);
        sqlx::query(
            r"
            INSERT INTO positions
                (id, owner, long_symbol, long_market_index, long_entry_price, long_weight,
                 short_symbol, short_market_index, short_entry_price, short_weight,
                 entry_ratio, capital, leverage, take_profit_ratio, stop_loss_ratio,
                 status, pending_leg, long_fill_pct, short_fill_pct, opened_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ",
        )
        .bind(record.id)
        .bind(&record.owner)
        .bind(&record.long_symbol)
        .bind(record.long_market_index)
        .bind(record.long_entry_price)
        .bind(record.long_weight)
        .bind(&record.short_symbol)
        .bind(record.short_market_index)
        .bind(record.short_entry_price)
        .bind(record.short_weight)
        .bind(record.entry_ratio)
        .bind(record.capital)
        .bind(record.leverage)
        .bind(record.take_profit_ratio)
        .bind(record.stop_loss_ratio)
        .bind(&record.status)
        .bind(&record.pending_leg)
        .bind(record.long_fill_pct)
        .bind(record.short_fill_pct)
        .bind(record.opened_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn promote_partial(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE positions
            SET status = 'OPEN', pending_leg = NULL,
                long_fill_pct = NULL, short_fill_pct = NULL
            WHERE id = $1 AND status = 'PARTIAL'
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn close_position(&self, id: Uuid, close: &CloseRecord) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE positions
            SET status = 'CLOSED', closed_at = $2, close_ratio = $3,
                close_long_price = $4, close_short_price = $5,
                realized_pnl = $6, realized_pnl_pct = $7, close_reason = $8
            WHERE id = $1 AND status = 'OPEN'
            ",
        )
        .bind(id)
        .bind(close.closed_at)
        .bind(close.close_ratio)
        .bind(close.close_long_price)
        .bind(close.close_short_price)
        .bind(close.realized_pnl)
        .bind(close.realized_pnl_pct)
        .bind(reason_to_str(close.reason))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_partial(&self, id: Uuid, close: &CloseRecord) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE positions
            SET status = 'CLOSED', closed_at = $2, close_ratio = $3,
                close_long_price = $4, close_short_price = $5,
                realized_pnl = $6, realized_pnl_pct = $7, close_reason = $8
            WHERE id = $1 AND status = 'PARTIAL'
            ",
        )
        .bind(id)
        .bind(close.closed_at)
        .bind(close.close_ratio)
        .bind(close.close_long_price)
        .bind(close.close_short_price)
        .bind(close.realized_pnl)
        .bind(close.realized_pnl_pct)
        .bind(reason_to_str(close.reason))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
