pub mod client;
pub mod connection;
pub mod session;

pub use client::DriftClient;
pub use connection::{ConnectionEvent, ConnectionManager};
pub use session::{DriftSession, DriftSessionFactory};
