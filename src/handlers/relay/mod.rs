//! Realtime relay WebSocket handlers
//!
//! Each client connection gets one [`RelaySession`] and, once authenticated,
//! one upstream connection opened with the client's own key.
//!
//! # Protocol
//!
//! ## Client → Relay
//!
//! - **auth**: `{"type":"auth","apiKey":"..."}`, must be the first frame
//! - Any other JSON frame is forwarded upstream unchanged
//! - **Binary frames**: forwarded upstream once the session is relaying
//!
//! ## Relay → Client
//!
//! - **connected**: upstream connection is open
//! - **error**: relay-originated failures
//! - Every upstream frame, unchanged

mod handler;
pub mod messages;
pub mod session;

pub use handler::relay_handler;
pub use messages::{ClientRoute, Frame, RelayFrame};
pub use session::{RelayAction, RelayError, RelaySession, RelayState};
