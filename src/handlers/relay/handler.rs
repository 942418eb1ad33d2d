//! Relay WebSocket handler
//!
//! Owns both sockets of one relayed session and feeds every event into the
//! [`RelaySession`] state machine, then carries out the actions it returns.

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as UpstreamMessage};
use tracing::{debug, info, warn};

use crate::core::upstream::{UpstreamError, UpstreamSocket, connect_upstream};
use crate::middleware::ClientIp;
use crate::state::AppState;

use super::messages::{ClientRoute, Frame};
use super::session::{RelayAction, RelaySession};

/// Optimized channel buffer size for audio workloads
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How often we check if the connection is stale
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on closing either socket during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type UpstreamSink = SplitSink<UpstreamSocket, UpstreamMessage>;
type UpstreamStream = SplitStream<UpstreamSocket>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<UpstreamSocket, UpstreamError>> + Send>>;

/// Releases the connection slot taken by the connection limit middleware.
struct ConnectionGuard {
    state: Arc<AppState>,
    ip: Option<IpAddr>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(ip) = self.ip {
            self.state.release_connection(ip);
        }
    }
}

enum RelayEvent {
    Client(Option<Result<Message, axum::Error>>),
    Upstream(Option<Result<UpstreamMessage, tungstenite::Error>>),
    UpstreamConnected(Result<UpstreamSocket, UpstreamError>),
    IdleCheck,
}

/// Relay WebSocket handler
///
/// Upgrades the HTTP connection to WebSocket. The client must authenticate
/// with its own upstream key in the first frame; the relay holds no key.
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    let guard = ConnectionGuard {
        state: state.clone(),
        ip: client_ip.map(|Extension(ClientIp(ip))| ip),
    };
    info!(ip = ?guard.ip, "Relay WebSocket connection upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let _guard = guard;
            handle_relay_socket(socket, state).await;
        })
}

async fn handle_relay_socket(socket: WebSocket, state: Arc<AppState>) {
    let mut session = RelaySession::new(state.session_settings.clone());
    let session_id = session.id().to_string();
    info!(session_id = %session_id, "Relay WebSocket connection established");

    let (client_sink, mut client_stream) = socket.split();
    let (client_tx, client_rx) = mpsc::channel::<ClientRoute>(CHANNEL_BUFFER_SIZE);
    let mut writer = tokio::spawn(client_writer(client_sink, client_rx, session_id.clone()));

    let mut upstream_sink: Option<UpstreamSink> = None;
    let mut upstream_stream: Option<UpstreamStream> = None;
    let mut connecting: Option<ConnectFuture> = None;

    let idle_timeout = state.config.idle_timeout();
    let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL.min(idle_timeout));
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    while !session.is_terminal() {
        let event = select! {
            msg = client_stream.next() => RelayEvent::Client(msg),
            msg = next_upstream(&mut upstream_stream) => RelayEvent::Upstream(msg),
            result = await_connect(&mut connecting) => RelayEvent::UpstreamConnected(result),
            _ = idle_check.tick() => RelayEvent::IdleCheck,
        };

        let actions = match event {
            RelayEvent::Client(Some(Ok(msg))) => {
                last_activity = Instant::now();
                match msg {
                    Message::Text(text) => session.on_client_text(text.as_str()),
                    Message::Binary(data) => session.on_client_binary(data),
                    Message::Close(_) => session.on_client_closed(),
                    Message::Ping(_) | Message::Pong(_) => Vec::new(),
                }
            }
            RelayEvent::Client(Some(Err(e))) => {
                warn!(session_id = %session_id, "Client WebSocket error: {}", e);
                session.on_client_closed()
            }
            RelayEvent::Client(None) => session.on_client_closed(),
            RelayEvent::Upstream(Some(Ok(msg))) => {
                last_activity = Instant::now();
                match msg {
                    UpstreamMessage::Text(text) => session.on_upstream_text(text.as_str()),
                    UpstreamMessage::Binary(data) => session.on_upstream_binary(data),
                    UpstreamMessage::Close(frame) => {
                        debug!(session_id = %session_id, ?frame, "Upstream sent close");
                        upstream_stream = None;
                        session.on_upstream_closed()
                    }
                    _ => Vec::new(),
                }
            }
            RelayEvent::Upstream(Some(Err(e))) => {
                warn!(session_id = %session_id, "Upstream WebSocket error: {}", e);
                upstream_stream = None;
                session.on_upstream_closed()
            }
            RelayEvent::Upstream(None) => {
                upstream_stream = None;
                session.on_upstream_closed()
            }
            RelayEvent::UpstreamConnected(Ok(socket)) => {
                let (sink, stream) = socket.split();
                upstream_sink = Some(sink);
                upstream_stream = Some(stream);
                last_activity = Instant::now();
                session.on_upstream_open()
            }
            RelayEvent::UpstreamConnected(Err(e)) => {
                session.on_upstream_connect_failed(&e.to_string())
            }
            RelayEvent::IdleCheck => {
                if last_activity.elapsed() >= idle_timeout {
                    warn!(
                        session_id = %session_id,
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Relay connection idle, closing"
                    );
                    session.on_idle_timeout()
                } else {
                    Vec::new()
                }
            }
        };

        let mut queue: VecDeque<RelayAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                RelayAction::SendToClient(frame) => {
                    if client_tx.send(ClientRoute::Frame(frame)).await.is_err() {
                        debug!(session_id = %session_id, "Client writer gone");
                        queue.extend(session.on_client_closed());
                    }
                }
                RelayAction::SendToUpstream(frame) => {
                    let Some(sink) = upstream_sink.as_mut() else {
                        warn!(session_id = %session_id, "No upstream connection for outbound frame");
                        continue;
                    };
                    if let Err(e) = sink.send(to_upstream_message(frame)).await {
                        warn!(session_id = %session_id, "Failed to send to upstream: {}", e);
                        upstream_sink = None;
                        upstream_stream = None;
                        queue.extend(session.on_upstream_closed());
                    }
                }
                RelayAction::ConnectUpstream(api_key) => {
                    let config = state.upstream.clone();
                    connecting = Some(Box::pin(async move {
                        connect_upstream(&config, api_key.as_str()).await
                    }));
                }
                RelayAction::CloseUpstream => {
                    connecting = None;
                    upstream_stream = None;
                    if let Some(sink) = upstream_sink.take() {
                        close_upstream(sink, &session_id).await;
                    }
                }
                RelayAction::CloseClient => {
                    let _ = client_tx.send(ClientRoute::Close).await;
                }
            }
        }
    }

    // Cleanup
    drop(connecting);
    if let Some(sink) = upstream_sink.take() {
        close_upstream(sink, &session_id).await;
    }
    drop(client_tx);
    if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(
        session_id = %session_id,
        state = %session.state(),
        "Relay WebSocket connection terminated"
    );
}

/// Writes routed frames to the client until the channel closes or a close is routed.
async fn client_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut routes: mpsc::Receiver<ClientRoute>,
    session_id: String,
) {
    while let Some(route) = routes.recv().await {
        let result = match route {
            ClientRoute::Frame(Frame::Text(text)) => sender.send(Message::Text(text.into())).await,
            ClientRoute::Frame(Frame::Binary(data)) => sender.send(Message::Binary(data)).await,
            ClientRoute::Close => {
                debug!(session_id = %session_id, "Closing client WebSocket");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        };

        if let Err(e) = result {
            debug!(session_id = %session_id, "Failed to send to client: {}", e);
            break;
        }
    }
    let _ = sender.close().await;
}

async fn close_upstream(mut sink: UpstreamSink, session_id: &str) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => debug!(session_id = %session_id, "Upstream connection closed"),
        Ok(Err(e)) => debug!(session_id = %session_id, "Upstream close error: {}", e),
        Err(_) => debug!(session_id = %session_id, "Upstream close timed out"),
    }
}

fn to_upstream_message(frame: Frame) -> UpstreamMessage {
    match frame {
        Frame::Text(text) => UpstreamMessage::Text(text.into()),
        Frame::Binary(data) => UpstreamMessage::Binary(data),
    }
}

async fn next_upstream(
    stream: &mut Option<UpstreamStream>,
) -> Option<Result<UpstreamMessage, tungstenite::Error>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn await_connect(
    connecting: &mut Option<ConnectFuture>,
) -> Result<UpstreamSocket, UpstreamError> {
    match connecting.as_mut() {
        Some(fut) => {
            let result = fut.await;
            *connecting = None;
            result
        }
        None => std::future::pending().await,
    }
}
