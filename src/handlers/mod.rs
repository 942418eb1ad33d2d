//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `relay` - Credential-forwarding WebSocket relay to the realtime upstream

pub mod api;
pub mod relay;

pub use relay::relay_handler;
