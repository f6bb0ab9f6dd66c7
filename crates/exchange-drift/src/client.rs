//! Drift gateway REST client with rate limiting.

use anyhow::{anyhow, Result};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use pair_trade_core::MarginRatios;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct OraclePriceResponse {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarginRatioResponse {
    initial_margin_ratio: Decimal,
    maintenance_margin_ratio: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerpPositionResponse {
    market_index: u16,
    base_asset_amount: Decimal,
}

pub struct DriftClient {
    http_client: Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl DriftClient {
    /// Creates a client against the given gateway base URL.
    ///
    /// Rate limited to 20 requests per second.
    #[must_use]
    pub fn new(base_url: String) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(20).expect("nonzero"));
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Self {
            http_client: Client::new(),
            base_url,
            rate_limiter,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("GET {}", url);

        let response = self.http_client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("drift gateway error {}: {}", status, text));
        }

        Ok(response.json::<T>().await?)
    }

    /// Fetches the venue's authoritative oracle price for a market.
    ///
    /// # Errors
    /// Returns an error if the request fails or the response cannot be parsed.
    pub async fn oracle_price(&self, market_index: u16) -> Result<Decimal> {
        let response: OraclePriceResponse = self
            .get(&format!("/oraclePrice?marketIndex={market_index}"))
            .await?;
        Ok(response.price)
    }

    /// Fetches initial/maintenance margin ratios for a market.
    ///
    /// # Errors
    /// Returns an error if the request fails; callers fall back to the
    /// configured default ratios.
    pub async fn margin_ratios(&self, market_index: u16) -> Result<MarginRatios> {
        let response: MarginRatioResponse = self
            .get(&format!("/marginRatio?marketIndex={market_index}"))
            .await?;
        Ok(MarginRatios {
            initial: response.initial_margin_ratio,
            maintenance: response.maintenance_margin_ratio,
        })
    }

    /// Fetches every perp leg size for one owner, keyed by market index.
    ///
    /// One call serves all of that owner's open positions, so a sweep is
    /// O(owners), not O(positions).
    ///
    /// # Errors
    /// Returns an error if the request fails or the response cannot be parsed.
    pub async fn leg_sizes(&self, owner: &str) -> Result<HashMap<u16, Decimal>> {
        let positions: Vec<PerpPositionResponse> = self
            .get(&format!("/user/{owner}/perpPositions"))
            .await?;
        Ok(positions
            .into_iter()
            .map(|p| (p.market_index, p.base_asset_amount))
            .collect())
    }

    /// Lightweight liveness endpoint.
    ///
    /// # Errors
    /// Returns an error if the gateway is unreachable.
    pub async fn health(&self) -> Result<()> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}/health", self.base_url);
        let response = self.http_client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("drift gateway unhealthy: {}", response.status()));
        }
        Ok(())
    }
}
