//! Client session controller.
//!
//! A single actor task owns the relay connection, the recorder and the playback
//! queue. [`ClientSessionController`] is a handle that sends it commands; state
//! changes are published on a `watch` channel.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::state::{ChatMessage, ChatRole, ClientState, PlaybackEffect};
use crate::core::audio::{
    AudioError, AudioInputDevice, AudioOutput, AudioRecorder, BlockCallback, CaptureConfig,
    PlaybackQueue,
};
use crate::core::codec;
use crate::core::upstream::{ClientEvent, ConversationItem, ServerEvent};
use crate::handlers::relay::messages::AUTH_FRAME_TYPE;

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type RelaySink = SplitSink<RelaySocket, Message>;
type RelayStream = SplitStream<RelaySocket>;

/// Failures reported to callers of [`ClientSessionController`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("An API key is required to connect")]
    MissingCredential,
    #[error("Not connected to the relay")]
    NotConnected,
    #[error("Relay transport error: {0}")]
    Transport(String),
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
    #[error("Client controller has shut down")]
    ControllerClosed,
}

/// Client session configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL, e.g. `ws://localhost:3001/realtime`
    pub relay_url: String,
    /// Upstream API key forwarded to the relay in the auth frame
    pub api_key: Zeroizing<String>,
    pub capture: CaptureConfig,
    /// Clear assistant playback when the user starts speaking
    pub interrupt_on_speech: bool,
    /// Optional bound on queued playback buffers (oldest dropped)
    pub max_queued_buffers: Option<usize>,
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            api_key: Zeroizing::new(api_key.into()),
            capture: CaptureConfig::default(),
            interrupt_on_speech: false,
            max_queued_buffers: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("relay_url", &self.relay_url)
            .field("api_key", &"[REDACTED]")
            .field("capture", &self.capture)
            .field("interrupt_on_speech", &self.interrupt_on_speech)
            .field("max_queued_buffers", &self.max_queued_buffers)
            .finish()
    }
}

type Reply = oneshot::Sender<Result<(), ClientError>>;

enum Command {
    Connect(Reply),
    StartRecording(Reply),
    StopRecording(Reply),
    SendText(String, Reply),
    Disconnect(Reply),
}

/// Handle to a client session.
///
/// Dropping the handle disconnects and releases every audio resource.
pub struct ClientSessionController {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ClientState>,
}

impl ClientSessionController {
    /// Spawn the session actor. Must be called from within a Tokio runtime.
    pub fn new(
        config: ClientConfig,
        input: Arc<dyn AudioInputDevice>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ClientState::default());
        let actor = SessionActor::new(config, input, output, state_tx);
        // The actor tears down and exits once every handle is gone and the
        // command channel closes.
        tokio::spawn(actor.run(command_rx));
        Self { commands, state }
    }

    /// Open the relay connection and authenticate.
    ///
    /// # Errors
    /// * `ClientError::MissingCredential` if no API key is configured; no
    ///   connection is attempted
    /// * `ClientError::Transport` if the relay cannot be reached
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.request(Command::Connect).await
    }

    /// Attach the microphone and stream captured blocks upstream.
    ///
    /// A second call while recording is a no-op.
    pub async fn start_recording(&self) -> Result<(), ClientError> {
        self.request(Command::StartRecording).await
    }

    /// Detach the microphone. The capture handle is closed before this returns.
    pub async fn stop_recording(&self) -> Result<(), ClientError> {
        self.request(Command::StopRecording).await
    }

    /// Send a user text turn and request a response.
    pub async fn send_text_message(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| Command::SendText(text, reply)).await
    }

    /// Stop recording, clear playback and close the connection. Idempotent.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(Command::Disconnect).await
    }

    /// Current state snapshot.
    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ClientError::ControllerClosed)?;
        response.await.map_err(|_| ClientError::ControllerClosed)?
    }
}

struct SessionActor {
    config: ClientConfig,
    recorder: AudioRecorder,
    playback: PlaybackQueue,
    state: ClientState,
    state_tx: watch::Sender<ClientState>,
    sink: Option<RelaySink>,
    stream: Option<RelayStream>,
    blocks_tx: mpsc::UnboundedSender<Vec<f32>>,
    blocks_rx: mpsc::UnboundedReceiver<Vec<f32>>,
}

enum ActorEvent {
    Command(Option<Command>),
    Inbound(Option<Result<Message, tungstenite::Error>>),
    Block(Vec<f32>),
}

impl SessionActor {
    fn new(
        config: ClientConfig,
        input: Arc<dyn AudioInputDevice>,
        output: Arc<dyn AudioOutput>,
        state_tx: watch::Sender<ClientState>,
    ) -> Self {
        let (blocks_tx, blocks_rx) = mpsc::unbounded_channel();
        Self {
            recorder: AudioRecorder::new(input, config.capture.clone()),
            playback: PlaybackQueue::with_options(
                output,
                config.capture.sample_rate,
                config.max_queued_buffers,
            ),
            config,
            state: ClientState::default(),
            state_tx,
            sink: None,
            stream: None,
            blocks_tx,
            blocks_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => ActorEvent::Command(command),
                msg = next_inbound(&mut self.stream) => ActorEvent::Inbound(msg),
                Some(block) = self.blocks_rx.recv() => ActorEvent::Block(block),
            };

            match event {
                ActorEvent::Command(Some(command)) => self.handle_command(command).await,
                ActorEvent::Command(None) => {
                    debug!("Client controller dropped, tearing down session");
                    self.teardown().await;
                    break;
                }
                ActorEvent::Inbound(Some(Ok(msg))) => self.handle_inbound(msg).await,
                ActorEvent::Inbound(Some(Err(e))) => {
                    warn!("Relay connection error: {}", e);
                    self.state.last_error = Some(ClientError::Transport(e.to_string()).to_string());
                    self.teardown().await;
                }
                ActorEvent::Inbound(None) => {
                    info!("Relay closed the connection");
                    self.teardown().await;
                }
                ActorEvent::Block(block) => self.handle_block(block).await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::StartRecording(reply) => {
                let _ = reply.send(self.start_recording());
            }
            Command::StopRecording(reply) => {
                self.stop_recording();
                let _ = reply.send(Ok(()));
            }
            Command::SendText(text, reply) => {
                let result = self.send_text(text).await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.teardown().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        if self.config.api_key.trim().is_empty() {
            return Err(self.fail(ClientError::MissingCredential));
        }
        if self.sink.is_some() {
            return Ok(());
        }
        // Output problems surface here rather than on the first audio delta
        self.playback
            .prepare()
            .map_err(|e| self.fail(ClientError::Audio(e)))?;

        let url = self.config.relay_url.clone();
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| self.fail(ClientError::Transport(e.to_string())))?;
        let (mut sink, stream) = socket.split();

        let auth = serde_json::json!({
            "type": AUTH_FRAME_TYPE,
            "apiKey": self.config.api_key.as_str(),
        })
        .to_string();
        if let Err(e) = sink.send(Message::Text(auth.into())).await {
            return Err(self.fail(ClientError::Transport(e.to_string())));
        }

        info!(url = %self.config.relay_url, "Connected to relay");
        self.sink = Some(sink);
        self.stream = Some(stream);
        self.state.is_connected = true;
        self.state.last_error = None;
        self.publish();
        Ok(())
    }

    fn start_recording(&mut self) -> Result<(), ClientError> {
        if self.sink.is_none() {
            return Err(self.fail(ClientError::NotConnected));
        }
        if self.recorder.is_active() {
            return Ok(());
        }

        let blocks = self.blocks_tx.clone();
        let on_block: BlockCallback = Arc::new(move |block| {
            let _ = blocks.send(block);
        });
        self.recorder
            .start(on_block)
            .map_err(|e| self.fail(ClientError::Audio(e)))?;

        self.state.is_recording = true;
        self.publish();
        Ok(())
    }

    fn stop_recording(&mut self) {
        self.recorder.stop();
        // Blocks captured before the handle closed are not sent.
        while self.blocks_rx.try_recv().is_ok() {}
        if self.state.is_recording || self.state.audio_level != 0.0 {
            self.state.is_recording = false;
            self.state.audio_level = 0.0;
            self.publish();
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
        if self.sink.is_none() {
            return Err(self.fail(ClientError::NotConnected));
        }

        self.state
            .messages
            .push(ChatMessage::new(ChatRole::User, text.as_str()));
        self.publish();

        let item = ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(&text),
        };
        self.send_event(&item).await?;
        self.send_event(&ClientEvent::ResponseCreate).await
    }

    async fn handle_block(&mut self, block: Vec<f32>) {
        if !self.recorder.is_active() {
            return;
        }
        self.state.audio_level = codec::rms_level(&block);
        self.publish();

        let event = ClientEvent::audio_append(&block);
        if let Err(e) = self.send_event(&event).await {
            warn!("Failed to send captured audio: {}", e);
        }
    }

    async fn handle_inbound(&mut self, msg: Message) {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(frame) => {
                info!(?frame, "Relay sent close");
                self.teardown().await;
                return;
            }
            Message::Binary(data) => {
                debug!(bytes = data.len(), "Ignoring binary frame from relay");
                return;
            }
            _ => return,
        };

        let event: ServerEvent = match serde_json::from_str(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                warn!("Unparseable frame from relay: {}", e);
                return;
            }
        };

        match self.state.apply(event, self.config.interrupt_on_speech) {
            Some(PlaybackEffect::Enqueue(delta)) => {
                if let Err(e) = self.playback.enqueue_base64(&delta) {
                    warn!("Dropping undecodable audio delta: {}", e);
                }
            }
            Some(PlaybackEffect::Clear) => self.playback.clear(),
            None => {}
        }
        self.publish();
    }

    async fn send_event(&mut self, event: &ClientEvent) -> Result<(), ClientError> {
        let json = event
            .to_json()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let Some(sink) = self.sink.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            let error = self.fail(ClientError::Transport(e.to_string()));
            self.teardown().await;
            return Err(error);
        }
        Ok(())
    }

    /// Release the recorder, playback and connection. Safe to repeat.
    async fn teardown(&mut self) {
        self.recorder.stop();
        while self.blocks_rx.try_recv().is_ok() {}
        self.playback.clear();
        self.stream = None;
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!("Relay close error: {}", e);
            }
            info!("Disconnected from relay");
        }
        self.state.reset_connection();
        self.publish();
    }

    fn fail(&mut self, error: ClientError) -> ClientError {
        self.state.last_error = Some(error.to_string());
        self.publish();
        error
    }

    fn publish(&self) {
        self.state_tx.send_if_modified(|current| {
            if *current == self.state {
                false
            } else {
                *current = self.state.clone();
                true
            }
        });
    }
}

async fn next_inbound(
    stream: &mut Option<RelayStream>,
) -> Option<Result<Message, tungstenite::Error>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
