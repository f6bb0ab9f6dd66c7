use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use pair_trade_core::{
    compute_margin, pair_ratio, CloseReason, CloseRecord, MarginInputs, MarginSummary, Position,
    PositionStatus, PositionUpdate, VenueSession,
};
use pair_trade_monitor::{compute_close, SweepStats};
use pair_trade_pubsub::PRICE_CHANNEL;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// A position enriched with live venue numbers for the dashboard.
#[derive(Debug, Serialize)]
pub struct EnrichedPosition {
    #[serde(flatten)]
    pub position: Position,
    pub current_ratio: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub margin: MarginSummary,
}

type ApiError = (StatusCode, String);

fn retryable(err: &anyhow::Error) -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        format!("venue temporarily unavailable, retry shortly: {err:#}"),
    )
}

fn internal(err: &anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

async fn enrich(
    session: &dyn VenueSession,
    position: Position,
) -> anyhow::Result<EnrichedPosition> {
    let long_price = session.oracle_price(position.long.market_index).await?;
    let short_price = session.oracle_price(position.short.market_index).await?;
    let current_ratio = pair_ratio(long_price, short_price)?;
    let unrealized_pnl = position.unrealized_pnl(current_ratio);
    let unrealized_pnl_pct = position.unrealized_pnl_pct(current_ratio);

    // Venue ratios are best-effort; the calculator falls back to its
    // configured defaults when a market has none.
    let long_ratios = session.margin_ratios(position.long.market_index).await.ok();
    let short_ratios = session
        .margin_ratios(position.short.market_index)
        .await
        .ok();

    let margin = compute_margin(&MarginInputs {
        capital: position.capital,
        leverage: Decimal::from(position.leverage),
        entry_ratio: position.entry_ratio,
        long_weight: position.long.weight,
        short_weight: position.short.weight,
        long_ratios,
        short_ratios,
        unrealized_pnl,
    })?;

    Ok(EnrichedPosition {
        position,
        current_ratio,
        unrealized_pnl,
        unrealized_pnl_pct,
        margin,
    })
}

/// Lists an owner's open positions with live ratio, PnL, margin,
/// liquidation, and health numbers.
///
/// # Errors
/// Returns `503` when the venue is unreachable (retryable) and `500`
/// for store failures.
pub async fn get_open_positions(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<Vec<EnrichedPosition>>, ApiError> {
    let positions = state
        .store
        .open_for_owner(&owner)
        .await
        .map_err(|e| internal(&e))?;
    if positions.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let session = state.venue.session().await.map_err(|e| retryable(&e))?;

    let mut enriched = Vec::with_capacity(positions.len());
    for position in positions {
        let id = position.id;
        match enrich(session.as_ref(), position).await {
            Ok(e) => enriched.push(e),
            Err(e) => {
                // One bad market should not blank the whole dashboard.
                tracing::warn!("failed to enrich position {}: {:#}", id, e);
            }
        }
    }

    Ok(Json(enriched))
}

/// Manually closes a position at current oracle prices.
///
/// Uses the same close engine as the background workers, and the same
/// conditional write: if a worker got there first this returns `409`.
///
/// # Errors
/// `404` for an unknown id, `409` if the position is not open, `503`
/// when the venue is unreachable (retryable).
pub async fn close_position(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CloseRecord>, ApiError> {
    let position = state
        .store
        .get(id)
        .await
        .map_err(|e| internal(&e))?
        .ok_or((StatusCode::NOT_FOUND, format!("position {id} not found")))?;

    if position.status != PositionStatus::Open {
        return Err((
            StatusCode::CONFLICT,
            format!("position {id} is not open"),
        ));
    }

    let session = state.venue.session().await.map_err(|e| retryable(&e))?;
    let long_price = session
        .oracle_price(position.long.market_index)
        .await
        .map_err(|e| retryable(&e))?;
    let short_price = session
        .oracle_price(position.short.market_index)
        .await
        .map_err(|e| retryable(&e))?;

    let close = compute_close(&position, long_price, short_price, CloseReason::Manual)
        .map_err(|e| internal(&anyhow::Error::new(e)))?;

    let written = state
        .store
        .close_position(id, &close)
        .await
        .map_err(|e| internal(&e))?;
    if !written {
        return Err((
            StatusCode::CONFLICT,
            format!("position {id} was already closed"),
        ));
    }

    let update = PositionUpdate {
        position_id: position.id,
        owner: position.owner.clone(),
        unrealized_pnl: close.realized_pnl,
        pnl_pct: close.realized_pnl_pct,
        current_ratio: close.close_ratio,
        long_price: close.close_long_price,
        short_price: close.close_short_price,
        timestamp: Utc::now(),
    };
    state.publisher.publish(PRICE_CHANNEL, &update).await;
    let _ = state.updates.send(update);

    Ok(Json(close))
}

/// Last reconciliation sweep summary, served from memory.
///
/// # Errors
/// Returns `404` until the first sweep has completed.
pub async fn worker_status(
    State(state): State<AppState>,
) -> Result<Json<SweepStats>, ApiError> {
    state.worker_status.latest().await.map(Json).ok_or((
        StatusCode::NOT_FOUND,
        "no sweep has completed yet".to_string(),
    ))
}
