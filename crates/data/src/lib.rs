//! PostgreSQL persistence for the pair trading service.
//!
//! One durable table of position records keyed by id, with a secondary
//! index on (owner, status) backing the "all open positions for owner"
//! and trigger-scan queries.

pub mod models;
pub mod positions;

pub use models::PositionRecord;
pub use positions::PositionRepository;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connects a pool to the specified `PostgreSQL` database.
///
/// # Errors
/// Returns an error if the database connection cannot be established.
/// This is the one startup failure that aborts the process.
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}
