//! Cached venue connection manager.
//!
//! One live session per process. `acquire` hands out the cached session
//! while it is fresh; initialization is serialized so a burst of first
//! users pays for exactly one handshake. A refresh timer retires the
//! cache shortly before it expires so the handshake cost lands on a
//! background task instead of a user-facing request.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use pair_trade_core::{HealthEvent, SessionFactory, SessionProvider, VenueSession};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Emitted on the manager's event channel; the runner bridges these to
/// the pub/sub heartbeat channel.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    HealthCheckFailed { detail: String },
    ProactiveRefresh { generation: u64 },
}

struct CachedConnection {
    session: Arc<dyn VenueSession>,
    generation: u64,
    created_at: Instant,
}

pub struct ConnectionManager {
    factory: Arc<dyn SessionFactory>,
    cache: RwLock<Option<CachedConnection>>,
    /// Serializes the "create new session" critical section only;
    /// fresh-cache reads go through the RwLock read path.
    init_lock: Mutex<()>,
    generation: AtomicU64,
    cache_timeout: Duration,
    probe_timeout: Duration,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        cache_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            factory,
            cache: RwLock::new(None),
            init_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            cache_timeout,
            probe_timeout,
            events,
        }
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Returns a ready, subscribed session, reusing the cached one when
    /// it is younger than the cache timeout.
    ///
    /// Concurrent callers with a cold cache serialize on the init lock
    /// and re-check after acquiring it, so exactly one handshake runs.
    /// A failed handshake leaves the slot empty and propagates; the
    /// next caller retries. There is no retry loop in here.
    ///
    /// # Errors
    /// Returns an error if the venue handshake fails. Acquisition
    /// failures are retryable.
    pub async fn acquire(&self) -> Result<Arc<dyn VenueSession>> {
        if let Some(session) = self.fresh().await {
            return Ok(session);
        }

        let _guard = self.init_lock.lock().await;
        // A concurrent caller may have initialized while we waited.
        if let Some(session) = self.fresh().await {
            return Ok(session);
        }

        let session = self.factory.connect().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.cache.write().await = Some(CachedConnection {
            session: Arc::clone(&session),
            generation,
            created_at: Instant::now(),
        });
        tracing::info!("venue session initialized (generation {})", generation);

        Ok(session)
    }

    // Read lock only, so a warm cache never serializes its readers.
    async fn fresh(&self) -> Option<Arc<dyn VenueSession>> {
        let cache = self.cache.read().await;
        let cached = cache.as_ref()?;
        if cached.created_at.elapsed() >= self.cache_timeout {
            return None;
        }
        Some(Arc::clone(&cached.session))
    }

    /// Drops the cached session so the next `acquire` reinitializes.
    ///
    /// Idempotent, and safe to call from the refresh timer, the health
    /// check, or a caller that detected stale data. When `generation`
    /// is given, only that instance is evicted; a newer cache stays.
    pub async fn invalidate(&self, generation: Option<u64>) {
        let mut cache = self.cache.write().await;
        let evict = match (&*cache, generation) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(cached), Some(expected)) => cached.generation == expected,
        };
        if evict {
            if let Some(cached) = cache.take() {
                tracing::debug!("invalidated venue session (generation {})", cached.generation);
                let session = cached.session;
                // Best effort; the socket is going away either way.
                tokio::spawn(async move {
                    if let Err(e) = session.unsubscribe().await {
                        tracing::debug!("unsubscribe on invalidate failed: {}", e);
                    }
                });
            }
        }
    }

    /// Retires the cache at ~90% of its lifetime so the next caller
    /// never waits out the handshake inline.
    pub fn spawn_refresh_timer(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let refresh_age = manager.cache_timeout.mul_f64(0.9);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(refresh_age);
            tick.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        let snapshot = {
                            let cache = manager.cache.read().await;
                            cache.as_ref().map(|c| (c.generation, c.created_at))
                        };
                        if let Some((generation, created_at)) = snapshot {
                            if created_at.elapsed() >= refresh_age {
                                tracing::debug!(
                                    "proactively refreshing venue session (generation {})",
                                    generation
                                );
                                manager.invalidate(Some(generation)).await;
                                let _ = manager
                                    .events
                                    .send(ConnectionEvent::ProactiveRefresh { generation });
                            }
                        }
                    }
                }
            }
            tracing::debug!("connection refresh timer stopped");
        })
    }

    /// Probes the live session on a fixed interval; a failed or timed
    /// out probe invalidates the cache and emits a health event.
    pub fn spawn_health_check(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => manager.run_health_probe().await,
                }
            }
            tracing::debug!("connection health check stopped");
        })
    }

    async fn run_health_probe(&self) {
        let snapshot = {
            let cache = self.cache.read().await;
            cache
                .as_ref()
                .map(|c| (Arc::clone(&c.session), c.generation))
        };
        let Some((session, generation)) = snapshot else {
            return;
        };

        let result = tokio::time::timeout(self.probe_timeout, session.probe()).await;
        let detail = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("venue health probe failed: {e}"),
            Err(_) => format!(
                "venue health probe timed out after {:?}",
                self.probe_timeout
            ),
        };

        tracing::warn!("{}", detail);
        self.invalidate(Some(generation)).await;
        let _ = self
            .events
            .send(ConnectionEvent::HealthCheckFailed { detail });
    }

    /// Heartbeat payload for the pub/sub health channel.
    #[must_use]
    pub fn health_event(healthy: bool, detail: impl Into<String>) -> HealthEvent {
        HealthEvent {
            healthy,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl SessionProvider for ConnectionManager {
    async fn session(&self) -> Result<Arc<dyn VenueSession>> {
        self.acquire().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pair_trade_core::MarginRatios;
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicBool;

    struct FakeSession;

    #[async_trait]
    impl VenueSession for FakeSession {
        async fn subscribe(&self) -> Result<()> {
            Ok(())
        }
        async fn unsubscribe(&self) -> Result<()> {
            Ok(())
        }
        async fn probe(&self) -> Result<()> {
            Ok(())
        }
        async fn leg_sizes(&self, _owner: &str) -> Result<std::collections::HashMap<u16, Decimal>> {
            Ok(std::collections::HashMap::new())
        }
        async fn oracle_price(&self, _market_index: u16) -> Result<Decimal> {
            Ok(Decimal::ONE)
        }
        async fn margin_ratios(&self, _market_index: u16) -> Result<MarginRatios> {
            Ok(MarginRatios::fallback())
        }
    }

    struct FakeFactory {
        connects: AtomicU64,
        fail: AtomicBool,
        delay: Duration,
    }

    impl FakeFactory {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                delay,
            })
        }
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn connect(&self) -> Result<Arc<dyn VenueSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("handshake refused");
            }
            Ok(Arc::new(FakeSession))
        }
    }

    fn manager(factory: Arc<FakeFactory>, timeout: Duration) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(
            factory,
            timeout,
            Duration::from_millis(100),
        ))
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_handshake() {
        let factory = FakeFactory::new(Duration::from_millis(50));
        let manager = manager(Arc::clone(&factory), Duration::from_secs(300));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.acquire().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_handshake_propagates_and_next_caller_retries() {
        let factory = FakeFactory::new(Duration::from_millis(1));
        factory.fail.store(true, Ordering::SeqCst);
        let manager = manager(Arc::clone(&factory), Duration::from_secs(300));

        assert!(manager.acquire().await.is_err());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);

        factory.fail.store(false, Ordering::SeqCst);
        assert!(manager.acquire().await.is_ok());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fresh_cache_is_reused() {
        let factory = FakeFactory::new(Duration::from_millis(1));
        let manager = manager(Arc::clone(&factory), Duration::from_secs(300));

        manager.acquire().await.unwrap();
        manager.acquire().await.unwrap();
        manager.acquire().await.unwrap();

        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn warm_cache_serves_concurrent_readers_without_reconnect() {
        let factory = FakeFactory::new(Duration::from_millis(1));
        let manager = manager(Arc::clone(&factory), Duration::from_secs(300));
        manager.acquire().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.acquire().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_cache_reinitializes() {
        let factory = FakeFactory::new(Duration::from_millis(1));
        let manager = manager(Arc::clone(&factory), Duration::from_millis(20));

        manager.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.acquire().await.unwrap();

        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent_and_forces_reconnect() {
        let factory = FakeFactory::new(Duration::from_millis(1));
        let manager = manager(Arc::clone(&factory), Duration::from_secs(300));

        manager.acquire().await.unwrap();
        manager.invalidate(None).await;
        manager.invalidate(None).await;
        manager.acquire().await.unwrap();

        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn generation_guard_keeps_newer_cache() {
        let factory = FakeFactory::new(Duration::from_millis(1));
        let manager = manager(Arc::clone(&factory), Duration::from_secs(300));

        manager.acquire().await.unwrap();
        // A stale timer firing with an old generation must not evict
        // the current session.
        manager.invalidate(Some(999)).await;
        manager.acquire().await.unwrap();

        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }
}
