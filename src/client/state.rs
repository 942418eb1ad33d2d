//! Observable client state and the reducer that applies inbound events to it.

use time::OffsetDateTime;
use tracing::debug;

use crate::core::upstream::ServerEvent;

/// Speaker of a finalized conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

/// One finalized entry in the conversation log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: OffsetDateTime,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Snapshot of a client session, published on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientState {
    pub is_connected: bool,
    /// Microphone attached, or upstream reports the user speaking
    pub is_recording: bool,
    /// Assistant audio is arriving or playing
    pub is_speaking: bool,
    /// RMS of the last captured block, 0.0 - 1.0
    pub audio_level: f32,
    /// Assistant transcript deltas of the response in flight
    pub current_transcript: String,
    /// Append-only log of finalized entries
    pub messages: Vec<ChatMessage>,
    pub last_error: Option<String>,
}

/// Playback side effects produced by an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEffect {
    /// Decode and queue a base64 PCM16 chunk
    Enqueue(String),
    /// Drop queued and playing audio
    Clear,
}

impl ClientState {
    /// Apply one inbound event. Returns the playback work the caller must do.
    pub fn apply(&mut self, event: ServerEvent, interrupt_on_speech: bool) -> Option<PlaybackEffect> {
        match event {
            ServerEvent::Connected { message } => {
                debug!(message = ?message, "Relay connected to upstream");
                None
            }
            ServerEvent::Error { .. } => {
                self.last_error = event.error_message();
                None
            }
            ServerEvent::SpeechStarted => {
                self.is_recording = true;
                if interrupt_on_speech && self.is_speaking {
                    self.is_speaking = false;
                    return Some(PlaybackEffect::Clear);
                }
                None
            }
            ServerEvent::SpeechStopped => {
                self.is_recording = false;
                None
            }
            ServerEvent::TranscriptionCompleted { transcript } => {
                if !transcript.trim().is_empty() {
                    self.messages.push(ChatMessage::new(ChatRole::User, transcript));
                }
                None
            }
            ServerEvent::AudioDelta { delta } => {
                self.is_speaking = true;
                Some(PlaybackEffect::Enqueue(delta))
            }
            ServerEvent::AudioDone => {
                self.is_speaking = false;
                None
            }
            ServerEvent::AudioTranscriptDelta { delta } => {
                self.current_transcript.push_str(&delta);
                None
            }
            ServerEvent::AudioTranscriptDone => {
                let transcript = std::mem::take(&mut self.current_transcript);
                if !transcript.is_empty() {
                    self.messages
                        .push(ChatMessage::new(ChatRole::Assistant, transcript));
                }
                None
            }
            ServerEvent::SessionCreated | ServerEvent::SessionUpdated | ServerEvent::Unknown => None,
        }
    }

    /// Clear per-connection flags. The conversation log is kept.
    pub(crate) fn reset_connection(&mut self) {
        self.is_connected = false;
        self.is_recording = false;
        self.is_speaking = false;
        self.audio_level = 0.0;
        self.current_transcript.clear();
    }
}
