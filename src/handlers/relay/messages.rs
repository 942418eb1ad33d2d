//! Relay frame types.
//!
//! The relay inspects as little as possible. Client frames before the session
//! is relaying are read through [`FrameEnvelope`], which only pulls out the
//! `type` tag and the `apiKey` of auth frames. Everything else is forwarded as
//! the original text.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Type tag of the client auth frame.
pub const AUTH_FRAME_TYPE: &str = "auth";

/// Type tag of the upstream frame that triggers session configuration.
pub const SESSION_CREATED_FRAME_TYPE: &str = "session.created";

/// Acknowledgement text sent once upstream is open.
pub const CONNECTED_MESSAGE: &str = "Connected to realtime API";

/// A frame in either direction, kept in its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Routes for the client writer task.
#[derive(Debug)]
pub enum ClientRoute {
    Frame(Frame),
    Close,
}

/// Frames the relay itself originates.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum RelayFrame {
    #[serde(rename = "connected")]
    Connected { message: String },
    #[serde(rename = "error")]
    Error { message: String },
}

impl RelayFrame {
    pub fn connected() -> Self {
        RelayFrame::Connected {
            message: CONNECTED_MESSAGE.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RelayFrame::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Both variants are a tag plus one string field.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"Internal relay error"}"#.to_string()
        })
    }
}

/// Minimal view of a JSON frame.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FrameEnvelope {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(rename = "apiKey", default)]
    pub api_key: Option<String>,
}

impl FrameEnvelope {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_auth(&self) -> bool {
        self.frame_type == AUTH_FRAME_TYPE
    }
}

/// Substring pre-check run before [`peek_frame_type`] on relayed frames.
///
/// False only when the text cannot decode to an `auth` tag: it holds neither
/// the literal word nor a `\u` escape that could spell it.
pub fn may_be_auth_frame(text: &str) -> bool {
    text.contains(AUTH_FRAME_TYPE) || text.contains("\\u")
}

/// Tag check used on the relaying path.
///
/// Returns `None` for anything that is not an object with a string `type`.
pub fn peek_frame_type(text: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Tag {
        #[serde(rename = "type")]
        frame_type: String,
    }
    serde_json::from_str::<Tag>(text).ok().map(|t| t.frame_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_frame_serialization() {
        assert_eq!(
            RelayFrame::connected().to_json(),
            r#"{"type":"connected","message":"Connected to realtime API"}"#
        );
        assert_eq!(
            RelayFrame::error("boom").to_json(),
            r#"{"type":"error","message":"boom"}"#
        );
    }

    #[test]
    fn test_envelope_reads_auth() {
        let envelope = FrameEnvelope::parse(r#"{"type":"auth","apiKey":"sk-1"}"#).unwrap();
        assert!(envelope.is_auth());
        assert_eq!(envelope.api_key.as_deref(), Some("sk-1"));

        let envelope = FrameEnvelope::parse(r#"{"type":"response.create"}"#).unwrap();
        assert!(!envelope.is_auth());
        assert!(envelope.api_key.is_none());
    }

    #[test]
    fn test_envelope_rejects_untagged() {
        assert!(FrameEnvelope::parse(r#"{"apiKey":"sk-1"}"#).is_err());
        assert!(FrameEnvelope::parse("[1,2,3]").is_err());
        assert!(FrameEnvelope::parse("not json").is_err());
    }

    #[test]
    fn test_peek_frame_type() {
        assert_eq!(
            peek_frame_type(r#"{"type":"input_audio_buffer.append","audio":"AAAA"}"#).as_deref(),
            Some("input_audio_buffer.append")
        );
        assert_eq!(peek_frame_type("{broken"), None);
        assert_eq!(peek_frame_type(r#"{"type":42}"#), None);
    }

    #[test]
    fn test_may_be_auth_frame() {
        let append = format!(
            r#"{{"type":"input_audio_buffer.append","audio":"{}"}}"#,
            "QUJD".repeat(2048)
        );
        assert!(!may_be_auth_frame(&append));
        assert!(!may_be_auth_frame(r#"{"type":"response.create"}"#));

        assert!(may_be_auth_frame(r#"{"type":"auth","apiKey":"sk-1"}"#));
        assert!(may_be_auth_frame(r#"{ "type" : "auth" }"#));
        let escaped = r#"{"type":"\u0061uth","apiKey":"sk-1"}"#;
        assert!(may_be_auth_frame(escaped));
        assert_eq!(peek_frame_type(escaped).as_deref(), Some("auth"));
    }
}
