//! Client side of a relayed voice session.
//!
//! [`ClientSessionController`] connects to the relay, streams microphone audio
//! as `input_audio_buffer.append` frames, plays assistant audio, and keeps an
//! observable [`ClientState`] with the conversation log.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use waav_relay::client::{ClientConfig, ClientSessionController};
//! use waav_relay::core::audio::{ChannelInputDevice, SimulatedOutput};
//!
//! # async fn run() -> Result<(), waav_relay::client::ClientError> {
//! let (input, _feed) = ChannelInputDevice::new();
//! let (output, _events) = SimulatedOutput::new();
//! let controller = ClientSessionController::new(
//!     ClientConfig::new("ws://localhost:3001/realtime", "sk-..."),
//!     Arc::new(input),
//!     Arc::new(output),
//! );
//!
//! controller.connect().await?;
//! controller.send_text_message("Hello!").await?;
//! let mut updates = controller.subscribe();
//! while updates.changed().await.is_ok() {
//!     println!("{:?}", updates.borrow().messages);
//! }
//! # Ok(())
//! # }
//! ```

mod controller;
mod state;

pub use controller::{ClientConfig, ClientError, ClientSessionController};
pub use state::{ChatMessage, ChatRole, ClientState, PlaybackEffect};
