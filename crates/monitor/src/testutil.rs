//! In-memory fakes shared by the worker tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pair_trade_core::{
    CloseRecord, MarginRatios, Position, PositionStatus, PositionStore, SessionProvider,
    VenueSession,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    positions: Mutex<HashMap<Uuid, Position>>,
    pub close_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn with_positions(positions: Vec<Position>) -> Arc<Self> {
        let store = Self::default();
        {
            let mut map = store.positions.lock().unwrap();
            for position in positions {
                map.insert(position.id, position);
            }
        }
        Arc::new(store)
    }

    pub fn snapshot(&self, id: Uuid) -> Position {
        self.positions.lock().unwrap().get(&id).unwrap().clone()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn sweep_candidates(&self) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .cloned()
            .collect())
    }

    async fn open_with_triggers(&self) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .lock()
            .unwrap()
            .values()
            .filter(|p| {
                p.status == PositionStatus::Open
                    && (p.take_profit_ratio.is_some() || p.stop_loss_ratio.is_some())
            })
            .cloned()
            .collect())
    }

    async fn open_for_owner(&self, owner: &str) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.owner == owner && p.status == PositionStatus::Open)
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        Ok(self.positions.lock().unwrap().get(&id).cloned())
    }

    async fn insert(&self, position: &Position) -> Result<()> {
        self.positions
            .lock()
            .unwrap()
            .insert(position.id, position.clone());
        Ok(())
    }

    async fn promote_partial(&self, id: Uuid) -> Result<bool> {
        let mut positions = self.positions.lock().unwrap();
        match positions.get_mut(&id) {
            Some(p) if p.status == PositionStatus::Partial => {
                p.status = PositionStatus::Open;
                p.partial = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close_position(&self, id: Uuid, close: &CloseRecord) -> Result<bool> {
        let mut positions = self.positions.lock().unwrap();
        match positions.get_mut(&id) {
            Some(p) if p.status == PositionStatus::Open => {
                p.status = PositionStatus::Closed;
                p.close = Some(close.clone());
                self.close_writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_partial(&self, id: Uuid, close: &CloseRecord) -> Result<bool> {
        let mut positions = self.positions.lock().unwrap();
        match positions.get_mut(&id) {
            Some(p) if p.status == PositionStatus::Partial => {
                p.status = PositionStatus::Closed;
                p.partial = None;
                p.close = Some(close.clone());
                self.close_writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct FakeVenue {
    pub prices: Mutex<HashMap<u16, Decimal>>,
    pub legs: Mutex<HashMap<String, HashMap<u16, Decimal>>>,
    pub failing_owners: Mutex<HashSet<String>>,
}

impl FakeVenue {
    pub fn set_price(&self, market_index: u16, price: Decimal) {
        self.prices.lock().unwrap().insert(market_index, price);
    }

    pub fn set_leg(&self, owner: &str, market_index: u16, size: Decimal) {
        self.legs
            .lock()
            .unwrap()
            .entry(owner.to_string())
            .or_default()
            .insert(market_index, size);
    }

    pub fn fail_owner(&self, owner: &str) {
        self.failing_owners
            .lock()
            .unwrap()
            .insert(owner.to_string());
    }
}

#[async_trait]
impl VenueSession for FakeVenue {
    async fn subscribe(&self) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn leg_sizes(&self, owner: &str) -> Result<HashMap<u16, Decimal>> {
        if self.failing_owners.lock().unwrap().contains(owner) {
            return Err(anyhow!("venue timeout for {owner}"));
        }
        Ok(self
            .legs
            .lock()
            .unwrap()
            .get(owner)
            .cloned()
            .unwrap_or_default())
    }

    async fn oracle_price(&self, market_index: u16) -> Result<Decimal> {
        self.prices
            .lock()
            .unwrap()
            .get(&market_index)
            .copied()
            .ok_or_else(|| anyhow!("no oracle price for market {market_index}"))
    }

    async fn margin_ratios(&self, _market_index: u16) -> Result<MarginRatios> {
        Ok(MarginRatios::fallback())
    }
}

pub struct FakeProvider {
    pub session: Arc<FakeVenue>,
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn session(&self) -> Result<Arc<dyn VenueSession>> {
        Ok(Arc::clone(&self.session) as Arc<dyn VenueSession>)
    }
}
