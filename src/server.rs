use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::relay::{self, RelayState};

/// Assemble the full application router.
pub fn app(state: Arc<RelayState>) -> Router {
    relay::router(state).layer(CorsLayer::permissive())
}

/// Bind and serve until the process exits.
pub async fn serve(addr: SocketAddr, state: Arc<RelayState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relay gateway listening");
    axum::serve(listener, app(state)).await
}
