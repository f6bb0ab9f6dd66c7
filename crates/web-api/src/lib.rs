pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{ApiServer, AppState};
