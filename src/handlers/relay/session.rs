//! Relay session state machine.
//!
//! `RelaySession` holds no sockets. Each transport event is fed in through an
//! `on_*` method which returns the actions the driver must perform, in order.
//! The driver in `handler.rs` owns the sockets and executes the actions.
//!
//! ```text
//! AwaitingAuth -> ConnectingUpstream -> AwaitingUpstreamSession -> Relaying -> Closed
//!        \______________\_____________________\___________________\-> Failed
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::core::upstream::{ClientEvent, SessionSettings};

use super::messages::{
    AUTH_FRAME_TYPE, Frame, FrameEnvelope, RelayFrame, SESSION_CREATED_FRAME_TYPE,
    may_be_auth_frame, peek_frame_type,
};

/// Client frames held while the upstream connection is being opened.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 256;

/// Conditions reported to the client as `error` frames.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Not authenticated. Send an auth frame with your API key first.")]
    NotAuthenticated,
    #[error("Missing API key in auth frame")]
    MissingCredential,
    #[error("Already authenticated. Only the first auth frame is accepted.")]
    DuplicateAuth,
    #[error("Upstream connection error: {0}")]
    UpstreamConnect(String),
    #[error("Upstream connection closed")]
    UpstreamClosed,
    #[error("Invalid frame: {0}")]
    ProtocolParse(String),
    #[error("Binary frames are not accepted until the session is ready")]
    BinaryNotReady,
    #[error("Too many frames sent before the upstream connection opened")]
    PendingOverflow,
    #[error("Connection closed due to inactivity")]
    IdleTimeout,
}

/// Lifecycle of one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    AwaitingAuth,
    ConnectingUpstream,
    AwaitingUpstreamSession,
    Relaying,
    Closed,
    Failed,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingAuth => "awaiting_auth",
            Self::ConnectingUpstream => "connecting_upstream",
            Self::AwaitingUpstreamSession => "awaiting_upstream_session",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// States in which an upstream connection exists or is being opened.
    fn has_upstream(&self) -> bool {
        matches!(
            self,
            Self::ConnectingUpstream | Self::AwaitingUpstreamSession | Self::Relaying
        )
    }
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Work the driver must perform.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayAction {
    SendToClient(Frame),
    SendToUpstream(Frame),
    /// Open the upstream connection with this credential.
    ConnectUpstream(Zeroizing<String>),
    /// Close the upstream connection, or cancel it if still opening.
    CloseUpstream,
    CloseClient,
}

/// Per-connection relay state.
pub struct RelaySession {
    id: String,
    state: RelayState,
    settings: Arc<SessionSettings>,
    credential_received: bool,
    session_update_sent: bool,
    pending: VecDeque<Frame>,
    max_pending: usize,
}

impl RelaySession {
    pub fn new(settings: Arc<SessionSettings>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: RelayState::AwaitingAuth,
            settings,
            credential_received: false,
            session_update_sent: false,
            pending: VecDeque::new(),
            max_pending: DEFAULT_MAX_PENDING_FRAMES,
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RelayState::Closed | RelayState::Failed)
    }

    fn error_to_client(&self, error: RelayError) -> RelayAction {
        debug!(session_id = %self.id, state = %self.state, "Rejecting frame: {}", error);
        RelayAction::SendToClient(Frame::Text(RelayFrame::error(error.to_string()).to_json()))
    }

    fn transition(&mut self, next: RelayState) {
        if self.state != next {
            debug!(session_id = %self.id, from = %self.state, to = %next, "Relay state change");
            self.state = next;
        }
    }

    // =========================================================================
    // Client side
    // =========================================================================

    pub fn on_client_text(&mut self, text: &str) -> Vec<RelayAction> {
        match self.state {
            RelayState::AwaitingAuth => self.handle_auth_phase(text),
            RelayState::ConnectingUpstream => match self.check_client_frame(text) {
                Err(action) => vec![action],
                Ok(()) => self.hold(Frame::Text(text.to_string())),
            },
            RelayState::AwaitingUpstreamSession => match self.check_client_frame(text) {
                Err(action) => vec![action],
                Ok(()) => vec![RelayAction::SendToUpstream(Frame::Text(text.to_string()))],
            },
            RelayState::Relaying => {
                // Frames are opaque here apart from the auth tag, and only
                // parsed when a substring check says they could carry it.
                if may_be_auth_frame(text)
                    && peek_frame_type(text).is_some_and(|t| t == AUTH_FRAME_TYPE)
                {
                    return vec![self.error_to_client(RelayError::DuplicateAuth)];
                }
                vec![RelayAction::SendToUpstream(Frame::Text(text.to_string()))]
            }
            RelayState::Closed | RelayState::Failed => Vec::new(),
        }
    }

    pub fn on_client_binary(&mut self, data: bytes::Bytes) -> Vec<RelayAction> {
        match self.state {
            RelayState::Relaying => vec![RelayAction::SendToUpstream(Frame::Binary(data))],
            RelayState::Closed | RelayState::Failed => Vec::new(),
            _ => vec![self.error_to_client(RelayError::BinaryNotReady)],
        }
    }

    fn handle_auth_phase(&mut self, text: &str) -> Vec<RelayAction> {
        let envelope = match FrameEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => return vec![self.error_to_client(RelayError::ProtocolParse(e.to_string()))],
        };

        if !envelope.is_auth() {
            return vec![self.error_to_client(RelayError::NotAuthenticated)];
        }

        let api_key = Zeroizing::new(envelope.api_key.unwrap_or_default());
        if api_key.trim().is_empty() {
            return vec![self.error_to_client(RelayError::MissingCredential)];
        }

        self.credential_received = true;
        self.transition(RelayState::ConnectingUpstream);
        info!(session_id = %self.id, "Auth frame accepted, connecting upstream");
        vec![RelayAction::ConnectUpstream(api_key)]
    }

    /// Parse a client frame after auth. Rejects malformed frames and repeat auth.
    fn check_client_frame(&self, text: &str) -> Result<(), RelayAction> {
        let envelope = FrameEnvelope::parse(text)
            .map_err(|e| self.error_to_client(RelayError::ProtocolParse(e.to_string())))?;
        if envelope.is_auth() && self.credential_received {
            return Err(self.error_to_client(RelayError::DuplicateAuth));
        }
        Ok(())
    }

    fn hold(&mut self, frame: Frame) -> Vec<RelayAction> {
        if self.pending.len() >= self.max_pending {
            warn!(session_id = %self.id, max_pending = self.max_pending, "Dropping frame held for upstream");
            return vec![self.error_to_client(RelayError::PendingOverflow)];
        }
        self.pending.push_back(frame);
        Vec::new()
    }

    pub fn on_client_closed(&mut self) -> Vec<RelayAction> {
        if self.is_terminal() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.state.has_upstream() {
            actions.push(RelayAction::CloseUpstream);
        }
        self.pending.clear();
        info!(session_id = %self.id, state = %self.state, "Client closed, ending session");
        self.transition(RelayState::Closed);
        actions
    }

    // =========================================================================
    // Upstream side
    // =========================================================================

    pub fn on_upstream_open(&mut self) -> Vec<RelayAction> {
        if self.state != RelayState::ConnectingUpstream {
            // The client is gone; a late connection must not linger.
            return vec![RelayAction::CloseUpstream];
        }

        self.transition(RelayState::AwaitingUpstreamSession);
        let mut actions = Vec::with_capacity(self.pending.len() + 1);
        actions.push(RelayAction::SendToClient(Frame::Text(
            RelayFrame::connected().to_json(),
        )));
        actions.extend(self.pending.drain(..).map(RelayAction::SendToUpstream));
        actions
    }

    pub fn on_upstream_connect_failed(&mut self, reason: &str) -> Vec<RelayAction> {
        if self.state != RelayState::ConnectingUpstream {
            return Vec::new();
        }
        warn!(session_id = %self.id, "Upstream connection failed: {}", reason);
        let error = self.error_to_client(RelayError::UpstreamConnect(reason.to_string()));
        self.pending.clear();
        self.transition(RelayState::Failed);
        vec![error, RelayAction::CloseClient]
    }

    pub fn on_upstream_text(&mut self, text: &str) -> Vec<RelayAction> {
        match self.state {
            RelayState::AwaitingUpstreamSession => {
                let envelope = match FrameEnvelope::parse(text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(session_id = %self.id, "Malformed upstream frame: {}", e);
                        return vec![
                            self.error_to_client(RelayError::ProtocolParse(e.to_string())),
                        ];
                    }
                };

                let mut actions = vec![RelayAction::SendToClient(Frame::Text(text.to_string()))];
                if envelope.frame_type == SESSION_CREATED_FRAME_TYPE && !self.session_update_sent
                {
                    match self.session_update_frame() {
                        Ok(update) => {
                            self.session_update_sent = true;
                            actions.push(RelayAction::SendToUpstream(Frame::Text(update)));
                            self.transition(RelayState::Relaying);
                            info!(session_id = %self.id, "Session configured, relaying");
                        }
                        Err(e) => {
                            warn!(session_id = %self.id, "Failed to build session.update: {}", e);
                        }
                    }
                }
                actions
            }
            RelayState::Relaying => vec![RelayAction::SendToClient(Frame::Text(text.to_string()))],
            _ => Vec::new(),
        }
    }

    pub fn on_upstream_binary(&mut self, data: bytes::Bytes) -> Vec<RelayAction> {
        match self.state {
            RelayState::AwaitingUpstreamSession | RelayState::Relaying => {
                vec![RelayAction::SendToClient(Frame::Binary(data))]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_upstream_closed(&mut self) -> Vec<RelayAction> {
        if !matches!(
            self.state,
            RelayState::AwaitingUpstreamSession | RelayState::Relaying
        ) {
            return Vec::new();
        }
        info!(session_id = %self.id, state = %self.state, "Upstream closed, ending session");
        let error = self.error_to_client(RelayError::UpstreamClosed);
        self.transition(RelayState::Closed);
        vec![error, RelayAction::CloseClient]
    }

    /// No traffic on either side for the idle window.
    pub fn on_idle_timeout(&mut self) -> Vec<RelayAction> {
        if self.is_terminal() {
            return Vec::new();
        }
        let mut actions = vec![self.error_to_client(RelayError::IdleTimeout)];
        if self.state.has_upstream() {
            actions.push(RelayAction::CloseUpstream);
        }
        actions.push(RelayAction::CloseClient);
        self.pending.clear();
        self.transition(RelayState::Closed);
        actions
    }

    fn session_update_frame(&self) -> Result<String, serde_json::Error> {
        ClientEvent::SessionUpdate {
            session: self.settings.to_session_config(),
        }
        .to_json()
    }
}
