use crate::{handlers, websocket};
use axum::{
    routing::{get, post},
    Router,
};
use pair_trade_core::{PositionStore, PositionUpdate, SessionProvider};
use pair_trade_monitor::StatusHandle;
use pair_trade_pubsub::Publisher;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Everything the handlers need, shared across requests.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PositionStore>,
    pub venue: Arc<dyn SessionProvider>,
    pub worker_status: StatusHandle,
    /// Local fan-out feed; the runner bridges pub/sub messages into it
    /// and every WebSocket connection taps it.
    pub updates: broadcast::Sender<PositionUpdate>,
    pub publisher: Arc<Publisher>,
}

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/positions/:owner", get(handlers::get_open_positions))
            .route("/api/positions/:id/close", post(handlers::close_position))
            .route("/api/worker/status", get(handlers::worker_status))
            .route("/ws/:owner", get(websocket::websocket_handler))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Starts the web server listening on the specified address.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the address or serve requests.
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("delivery API listening on {}", addr);

        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}
