//! Connection limit middleware for WebSocket connections
//!
//! This module provides middleware to enforce connection limits:
//! - Global maximum WebSocket connections
//! - Per-IP connection limits
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use waav_relay::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/realtime", get(relay_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::state::{AppState, ConnectionLimitError};

/// Extension type to carry the client IP through to the handler
/// so the handler can release the connection when done.
#[derive(Clone, Debug)]
pub struct ClientIp(pub IpAddr);

/// Slot held while the request is inside the middleware.
///
/// Released on drop unless ownership passed to the relay handler, which only
/// happens once the upgrade is accepted.
struct PendingSlot {
    state: Arc<AppState>,
    ip: IpAddr,
    armed: bool,
}

impl PendingSlot {
    fn hand_over(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if self.armed {
            self.state.release_connection(self.ip);
        }
    }
}

/// Middleware that enforces connection limits for WebSocket connections.
///
/// This middleware:
/// 1. Checks if the global WebSocket connection limit has been reached
/// 2. Checks if the per-IP connection limit has been reached
/// 3. Returns 503 Service Unavailable if global limit is exceeded
/// 4. Returns 429 Too Many Requests if per-IP limit is exceeded
/// 5. Injects `ClientIp` extension so the relay handler can release the slot later
/// 6. Releases the slot itself when the upgrade is refused (any status but 101)
///
/// Only WebSocket upgrade requests (detected by the Upgrade header) are counted.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return next.run(request).await;
    }

    let client_ip = addr.ip();

    match state.try_acquire_connection(client_ip) {
        Ok(()) => {
            let slot = PendingSlot {
                state: state.clone(),
                ip: client_ip,
                armed: true,
            };
            request.extensions_mut().insert(ClientIp(client_ip));
            let response = next.run(request).await;

            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                // Released by the relay handler when the session ends
                slot.hand_over();
            } else {
                tracing::debug!(
                    ip = %client_ip,
                    status = %response.status(),
                    "Upgrade refused, releasing connection slot"
                );
            }
            response
        }
        Err(ConnectionLimitError::GlobalLimitReached) => {
            tracing::warn!(
                ip = %client_ip,
                "Rejecting connection: global limit reached"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response()
        }
        Err(ConnectionLimitError::PerIpLimitReached) => {
            tracing::warn!(
                ip = %client_ip,
                "Rejecting connection: per-IP limit reached"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections from your IP address.",
            )
                .into_response()
        }
    }
}
