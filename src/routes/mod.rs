use axum::{Router, middleware, routing::get};
use std::sync::Arc;

use crate::handlers::api::health_check;
use crate::middleware::connection_limit_middleware;
use crate::state::AppState;

pub mod realtime;

/// Public health route plus the connection-limited relay route.
///
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// connection limit middleware reads the peer address.
pub fn create_app_router(state: Arc<AppState>) -> Router {
    let relay_routes = realtime::create_relay_router().layer(middleware::from_fn_with_state(
        state.clone(),
        connection_limit_middleware,
    ));

    Router::new()
        .route("/", get(health_check))
        .merge(relay_routes)
        .with_state(state)
}
