use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub drift: DriftConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Reconnect attempts before a subscriber gives up and requires
    /// operator intervention.
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    pub api_url: String,
    pub ws_url: String,
    /// Age after which a cached venue session is considered stale.
    pub cache_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    /// Bound on the health probe and on the handshake itself.
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub reconcile_interval_secs: u64,
    pub trigger_interval_secs: u64,
    /// Freshly opened positions are skipped for this long so the sweep
    /// does not race orders that are still filling.
    pub grace_period_secs: u64,
    /// Venue-side leg sizes below this are treated as closed.
    pub dust_threshold: Decimal,
    pub notify_webhook_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/pair_trade".to_string(),
                max_connections: 10,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                max_reconnect_attempts: 10,
            },
            drift: DriftConfig {
                api_url: "https://dlob.drift.trade".to_string(),
                ws_url: "wss://dlob.drift.trade/ws".to_string(),
                cache_timeout_secs: 300,
                health_check_interval_secs: 60,
                probe_timeout_secs: 5,
            },
            monitor: MonitorConfig {
                reconcile_interval_secs: 30,
                trigger_interval_secs: 30,
                grace_period_secs: 300,
                dust_threshold: Decimal::new(1, 3),
                notify_webhook_url: None,
            },
        }
    }
}
