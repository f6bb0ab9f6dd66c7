use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pair_trade_core::{ConfigLoader, PositionStore, SessionProvider};
use pair_trade_data::{connect_pool, PositionRepository};
use pair_trade_drift::{ConnectionEvent, ConnectionManager, DriftSessionFactory};
use pair_trade_monitor::{
    LogNotifier, Notifier, ReconciliationWorker, TpSlMonitor, WebhookNotifier,
};
use pair_trade_pubsub::{Publisher, Subscriber, HEALTH_CHANNEL, PRICE_CHANNEL};
use pair_trade_web_api::{ApiServer, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

#[derive(Parser)]
#[command(name = "pair-trade")]
#[command(about = "Leveraged pair position service for a perp venue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full service: workers, pub/sub bridges, and web API
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Run the delivery tier only (no reconciliation or TP/SL workers)
    Server {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Run one reconciliation sweep and print its stats
    Sweep {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_service(&config, true).await,
        Commands::Server { config } => run_service(&config, false).await,
        Commands::Sweep { config } => run_sweep(&config).await,
    }
}

async fn run_service(config_path: &str, with_workers: bool) -> Result<()> {
    let config = ConfigLoader::load_from(config_path)?;

    // The one startup failure that aborts the process.
    let pool = connect_pool(&config.database.url, config.database.max_connections)
        .await
        .context("cannot construct store client")?;
    let repository = PositionRepository::new(pool);
    repository.ensure_schema().await?;
    let store: Arc<dyn PositionStore> = Arc::new(repository);

    let factory = Arc::new(DriftSessionFactory::new(
        config.drift.api_url.clone(),
        config.drift.ws_url.clone(),
    ));
    let price_feed = factory.price_feed();
    let connections = Arc::new(ConnectionManager::new(
        Arc::clone(&factory) as Arc<dyn pair_trade_core::SessionFactory>,
        Duration::from_secs(config.drift.cache_timeout_secs),
        Duration::from_secs(config.drift.probe_timeout_secs),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    connections.spawn_refresh_timer(shutdown_rx.clone());
    connections.spawn_health_check(
        Duration::from_secs(config.drift.health_check_interval_secs),
        shutdown_rx.clone(),
    );

    let publisher = Arc::new(Publisher::new(&config.redis.url));
    spawn_health_bridge(&connections, Arc::clone(&publisher), shutdown_rx.clone());

    let worker = Arc::new(ReconciliationWorker::new(
        Arc::clone(&store),
        Arc::clone(&connections) as Arc<dyn SessionProvider>,
        Arc::clone(&publisher),
        Duration::from_secs(config.monitor.reconcile_interval_secs),
        config.monitor.grace_period_secs,
        config.monitor.dust_threshold,
    ));
    let worker_status = worker.status_handle();

    if with_workers {
        // This node holds the venue subscription, so it is the one
        // producer of live price deltas.
        spawn_price_bridge(price_feed, Arc::clone(&publisher), shutdown_rx.clone());

        tokio::spawn(Arc::clone(&worker).run(shutdown_rx.clone()));

        let notifier: Arc<dyn Notifier> = match &config.monitor.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };
        let monitor = Arc::new(TpSlMonitor::new(
            Arc::clone(&store),
            Arc::clone(&connections) as Arc<dyn SessionProvider>,
            Arc::clone(&publisher),
            notifier,
            Duration::from_secs(config.monitor.trigger_interval_secs),
        ));
        tokio::spawn(monitor.run(shutdown_rx.clone()));
    }

    // Remote updates flow: redis -> bus -> per-owner websocket feeds.
    let (updates_tx, _) = broadcast::channel(1024);
    spawn_update_bridge(&config, updates_tx.clone(), shutdown_rx.clone());

    let state = AppState {
        store,
        venue: Arc::clone(&connections) as Arc<dyn SessionProvider>,
        worker_status,
        updates: updates_tx,
        publisher,
    };
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let server = ApiServer::new(state);

    tokio::select! {
        result = server.serve(&addr) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Forwards connection-manager health events onto the heartbeat channel.
fn spawn_health_bridge(
    connections: &Arc<ConnectionManager>,
    publisher: Arc<Publisher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut events = connections.subscribe_events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => {
                    let Ok(event) = event else { break };
                    let health = match event {
                        ConnectionEvent::HealthCheckFailed { detail } => {
                            ConnectionManager::health_event(false, detail)
                        }
                        ConnectionEvent::ProactiveRefresh { generation } => {
                            ConnectionManager::health_event(
                                true,
                                format!("session generation {generation} refreshed"),
                            )
                        }
                    };
                    publisher.publish(HEALTH_CHANNEL, &health).await;
                }
            }
        }
    });
}

/// Publishes live oracle prices from the venue session's read loop
/// onto the price channel.
fn spawn_price_bridge(
    mut prices: broadcast::Receiver<pair_trade_core::PriceUpdate>,
    publisher: Arc<Publisher>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                update = prices.recv() => {
                    match update {
                        Ok(update) => publisher.publish(PRICE_CHANNEL, &update).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!("price bridge lagged, skipped {}", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
}

/// Subscribes to the price channel and feeds decoded position updates
/// into the local broadcast the websocket handlers serve from.
fn spawn_update_bridge(
    config: &pair_trade_core::AppConfig,
    updates_tx: broadcast::Sender<pair_trade_core::PositionUpdate>,
    shutdown: watch::Receiver<bool>,
) {
    let (bus_tx, mut bus_rx) = broadcast::channel(1024);
    let subscriber = Subscriber::new(
        &config.redis.url,
        vec![PRICE_CHANNEL.to_string(), HEALTH_CHANNEL.to_string()],
        config.redis.max_reconnect_attempts,
    );
    tokio::spawn(subscriber.run(bus_tx, shutdown));

    tokio::spawn(async move {
        loop {
            match bus_rx.recv().await {
                Ok(message) if message.channel == PRICE_CHANNEL => {
                    // Price ticks and position deltas share the channel;
                    // only the latter feed the per-owner streams.
                    if let Ok(update) =
                        serde_json::from_str::<pair_trade_core::PositionUpdate>(&message.payload)
                    {
                        let _ = updates_tx.send(update);
                    }
                }
                Ok(_) => {} // heartbeats are for operators, not viewers
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run_sweep(config_path: &str) -> Result<()> {
    let config = ConfigLoader::load_from(config_path)?;

    let pool = connect_pool(&config.database.url, config.database.max_connections)
        .await
        .context("cannot construct store client")?;
    let repository = PositionRepository::new(pool);
    repository.ensure_schema().await?;

    let factory = Arc::new(DriftSessionFactory::new(
        config.drift.api_url.clone(),
        config.drift.ws_url.clone(),
    ));
    let connections = Arc::new(ConnectionManager::new(
        factory,
        Duration::from_secs(config.drift.cache_timeout_secs),
        Duration::from_secs(config.drift.probe_timeout_secs),
    ));

    let worker = ReconciliationWorker::new(
        Arc::new(repository),
        connections as Arc<dyn SessionProvider>,
        Arc::new(Publisher::disabled()),
        Duration::from_secs(config.monitor.reconcile_interval_secs),
        config.monitor.grace_period_secs,
        config.monitor.dust_threshold,
    );

    let stats = worker.sweep_once().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
