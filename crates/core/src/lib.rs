pub mod config;
pub mod config_loader;
pub mod error;
pub mod events;
pub mod margin;
pub mod position;
pub mod traits;

pub use config::{
    AppConfig, DatabaseConfig, DriftConfig, MonitorConfig, RedisConfig, ServerConfig,
};
pub use config_loader::ConfigLoader;
pub use error::CalcError;
pub use events::{HealthEvent, PositionUpdate, PriceUpdate};
pub use margin::{compute_margin, MarginInputs, MarginRatios, MarginSummary};
pub use position::{
    pair_ratio, CloseReason, CloseRecord, Leg, LegSide, PartialFill, Position, PositionStatus,
};
pub use traits::{PositionStore, SessionFactory, SessionProvider, VenueSession};
