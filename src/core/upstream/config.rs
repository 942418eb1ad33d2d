//! Upstream realtime API settings.
//!
//! Covers where the relay connects (endpoint, model, timeout) and the session
//! configuration it injects once upstream reports `session.created`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::messages::{InputAudioTranscription, MaxTokens, SessionConfig, TurnDetection};

/// OpenAI Realtime API WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default realtime model.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Beta negotiation header value required by the realtime endpoint.
pub const OPENAI_BETA_HEADER_VALUE: &str = "realtime=v1";

/// Default upstream connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// System instructions injected into every session.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful, friendly voice assistant. \
    Keep your answers short and conversational, and speak naturally.";

/// Default transcription sub-model for user audio.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Default response temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.8;

/// Default server VAD activation threshold.
pub const DEFAULT_VAD_THRESHOLD: f32 = 0.5;

/// Default audio kept before detected speech, in ms.
pub const DEFAULT_VAD_PREFIX_PADDING_MS: u32 = 300;

/// Default silence that ends a turn, in ms.
pub const DEFAULT_VAD_SILENCE_DURATION_MS: u32 = 500;

// =============================================================================
// Voices
// =============================================================================

/// Voices accepted by the realtime API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeVoice {
    #[default]
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl RealtimeVoice {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ash" => Self::Ash,
            "ballad" => Self::Ballad,
            "coral" => Self::Coral,
            "echo" => Self::Echo,
            "sage" => Self::Sage,
            "shimmer" => Self::Shimmer,
            "verse" => Self::Verse,
            _ => Self::Alloy,
        }
    }
}

impl std::fmt::Display for RealtimeVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Connection settings
// =============================================================================

/// Where and how the relay opens its upstream connection.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    /// Base WebSocket URL, without the `model` query parameter
    pub url: String,
    /// Model requested via the `model` query parameter
    pub model: String,
    /// Upper bound on the WebSocket handshake
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: OPENAI_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl UpstreamConfig {
    /// Full endpoint URL including the model parameter.
    pub fn endpoint(&self) -> Result<url::Url, url::ParseError> {
        let mut url = url::Url::parse(&self.url)?;
        url.query_pairs_mut().append_pair("model", &self.model);
        Ok(url)
    }
}

// =============================================================================
// Injected session settings
// =============================================================================

/// Values carried by the one-time `session.update` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub instructions: String,
    pub voice: RealtimeVoice,
    pub transcription_model: String,
    pub temperature: f32,
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            voice: RealtimeVoice::default(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            vad_prefix_padding_ms: DEFAULT_VAD_PREFIX_PADDING_MS,
            vad_silence_duration_ms: DEFAULT_VAD_SILENCE_DURATION_MS,
        }
    }
}

impl SessionSettings {
    /// Build the session configuration sent upstream.
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: Some(self.instructions.clone()),
            voice: Some(self.voice.as_str().to_string()),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: Some(InputAudioTranscription {
                model: self.transcription_model.clone(),
            }),
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: Some(self.vad_threshold),
                prefix_padding_ms: Some(self.vad_prefix_padding_ms),
                silence_duration_ms: Some(self.vad_silence_duration_ms),
            }),
            temperature: Some(self.temperature),
            max_response_output_tokens: Some(MaxTokens::Infinite("inf".to_string())),
        }
    }
}
