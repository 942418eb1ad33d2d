//! Relay WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::relay::relay_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the relay WebSocket router
///
/// # Endpoint
///
/// `GET /realtime` - WebSocket upgrade for a relayed realtime session
///
/// # Protocol
///
/// ```json
/// // Client authenticates with its own upstream key
/// {"type": "auth", "apiKey": "sk-..."}
///
/// // Relay acknowledges once the upstream connection is open
/// {"type": "connected", "message": "Connected to realtime API"}
///
/// // From here on, frames pass through unchanged in both directions
/// ```
pub fn create_relay_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/realtime", get(relay_handler))
        .layer(TraceLayer::new_for_http())
}
