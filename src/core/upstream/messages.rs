//! Realtime API frame types.
//!
//! Only the frames the relay and the client build themselves are modelled as
//! outgoing events. Inbound frames are parsed leniently: the relay forwards
//! upstream frames verbatim and the client only reads the fields it needs.
//!
//! Client events (sent upstream):
//! - session.update
//! - input_audio_buffer.append
//! - conversation.item.create
//! - response.create
//!
//! Server events consumed by the client:
//! - session.created / session.updated
//! - input_audio_buffer.speech_started / speech_stopped
//! - conversation.item.input_audio_transcription.completed
//! - response.audio.delta / response.audio.done
//! - response.audio_transcript.delta / response.audio_transcript.done
//! - error

use serde::{Deserialize, Serialize};

use crate::core::codec;

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration carried by `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<MaxTokens>,
}

/// Maximum tokens configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MaxTokens {
    Number(i32),
    /// Unbounded, serialized as `"inf"`
    Infinite(String),
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
}

/// Turn detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TurnDetection {
    #[serde(rename = "server_vad")]
    ServerVad {
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
}

/// Content part within a conversation item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    /// Content type (input_text, input_audio, text, audio)
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ConversationItem {
    /// A user message holding one text part.
    pub fn user_text(text: &str) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart {
                content_type: "input_text".to_string(),
                text: Some(text.to_string()),
            }]),
        }
    }
}

// =============================================================================
// Client Events (sent upstream)
// =============================================================================

/// Frames sent towards the realtime API.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded PCM16 audio
        audio: String,
    },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Audio append frame for a block of float samples.
    pub fn audio_append(samples: &[f32]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: codec::encode(samples),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Server Events (received from upstream)
// =============================================================================

/// Error payload in upstream `error` frames.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Frames the client reacts to.
///
/// Relay errors carry a top-level `message`; upstream errors nest it under
/// `error`. Both land in [`ServerEvent::Error`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<ApiError>,
    },

    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Base64-encoded PCM16 audio
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone,

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Human-readable message of an error frame.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ServerEvent::Error { message, error } => Some(
                message
                    .clone()
                    .or_else(|| error.as_ref().and_then(|e| e.message.clone()))
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_append_serialization() {
        let event = ClientEvent::audio_append(&[1.0, -1.0]);
        let json = event.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"input_audio_buffer.append","audio":"/38AgA=="}"#
        );
    }

    #[test]
    fn test_text_turn_serialization() {
        let item = ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text("hello"),
        };
        let json: serde_json::Value = serde_json::from_str(&item.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "conversation.item.create");
        assert_eq!(json["item"]["type"], "message");
        assert_eq!(json["item"]["role"], "user");
        assert_eq!(json["item"]["content"][0]["type"], "input_text");
        assert_eq!(json["item"]["content"][0]["text"], "hello");

        let response = ClientEvent::ResponseCreate.to_json().unwrap();
        assert_eq!(response, r#"{"type":"response.create"}"#);
    }

    #[test]
    fn test_server_event_parsing_ignores_extra_fields() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"response.audio.delta","event_id":"e1","response_id":"r1","delta":"AAAA"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::AudioDelta {
                delta: "AAAA".to_string()
            }
        );

        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"session.created","session":{"id":"sess_1"}}"#,
        )
        .unwrap();
        assert_eq!(event, ServerEvent::SessionCreated);
    }

    #[test]
    fn test_unknown_server_event() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
    }

    #[test]
    fn test_error_message_shapes() {
        let relay: ServerEvent =
            serde_json::from_str(r#"{"type":"error","message":"Not authenticated"}"#).unwrap();
        assert_eq!(relay.error_message().as_deref(), Some("Not authenticated"));

        let upstream: ServerEvent = serde_json::from_str(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad audio"}}"#,
        )
        .unwrap();
        assert_eq!(upstream.error_message().as_deref(), Some("bad audio"));

        assert_eq!(ServerEvent::AudioDone.error_message(), None);
    }
}
