//! Realtime API upstream.
//!
//! The relay opens one outbound WebSocket per session to an OpenAI
//! Realtime-compatible endpoint.
//!
//! # Protocol
//!
//! - Endpoint: `{url}?model={model}`
//! - Headers: `Authorization: Bearer <client credential>`, `OpenAI-Beta: realtime=v1`
//! - Audio: base64 PCM16 little-endian, 24kHz mono
//!
//! After the endpoint sends `session.created` the relay injects one
//! `session.update` built from [`SessionSettings`].

mod config;
mod connect;
mod messages;

pub use config::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_INSTRUCTIONS, DEFAULT_REALTIME_MODEL,
    DEFAULT_TEMPERATURE, DEFAULT_TRANSCRIPTION_MODEL, DEFAULT_VAD_PREFIX_PADDING_MS,
    DEFAULT_VAD_SILENCE_DURATION_MS, DEFAULT_VAD_THRESHOLD, OPENAI_BETA_HEADER_VALUE,
    OPENAI_REALTIME_URL, RealtimeVoice, SessionSettings, UpstreamConfig,
};
pub use connect::{UpstreamError, UpstreamSocket, build_upstream_request, connect_upstream};
pub use messages::{
    ApiError, ClientEvent, ContentPart, ConversationItem, InputAudioTranscription, MaxTokens,
    ServerEvent, SessionConfig, TurnDetection,
};
