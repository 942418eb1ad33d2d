//! Mock realtime API and relay harness
//!
//! The mock accepts WebSocket connections the way the realtime API does:
//! - records the handshake headers and query
//! - greets with `session.created`
//! - answers `response.create` with a short scripted audio + transcript response
//! - closes the connection when it receives `{"type":"mock.close"}` or on
//!   [`MockUpstream::close_connections`]
//!
//! [`StalledUpstream`] reads the upgrade request and never answers it, to
//! observe what the relay does with a handshake still in flight.

// Not every test file uses every helper
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{Request, Response},
    },
};

use waav_relay::{ServerConfig, core::codec, routes, state::AppState};

pub const WAIT: Duration = Duration::from_secs(5);

/// Samples in the scripted assistant audio delta (0.1s at 24 kHz)
pub const SCRIPTED_AUDIO_SAMPLES: usize = 2400;

/// Transcript the scripted response spells out in two deltas
pub const SCRIPTED_TRANSCRIPT: &str = "Hi there";

/// What the mock saw during one upstream handshake.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub authorization: String,
    pub beta: String,
    pub path: String,
    pub query: String,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    received: mpsc::UnboundedReceiver<Message>,
    closed: mpsc::UnboundedReceiver<()>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock upstream should bind");
        let addr = listener.local_addr().expect("local addr should be available");

        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let (received_tx, received) = mpsc::unbounded_channel();
        let (closed_tx, closed) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(4);

        let accepted = handshakes.clone();
        let shutdown_tx = shutdown.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    accepted.clone(),
                    received_tx.clone(),
                    closed_tx.clone(),
                    shutdown_tx.subscribe(),
                ));
            }
        });

        Self {
            addr,
            handshakes,
            received,
            closed,
            shutdown,
            task,
        }
    }

    /// Base URL to configure as the relay's upstream.
    pub fn url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().expect("handshake lock").clone()
    }

    pub fn connection_count(&self) -> usize {
        self.handshakes.lock().expect("handshake lock").len()
    }

    /// Next frame the mock received from the relay.
    pub async fn next_message(&mut self) -> Message {
        timeout(WAIT, self.received.recv())
            .await
            .expect("mock upstream should receive a frame")
            .expect("mock upstream channel open")
    }

    /// Next text frame, parsed.
    pub async fn next_json(&mut self) -> Value {
        loop {
            if let Message::Text(text) = self.next_message().await {
                return serde_json::from_str(text.as_str()).expect("frame should be JSON");
            }
        }
    }

    /// Next text frame, raw.
    pub async fn next_text(&mut self) -> String {
        loop {
            if let Message::Text(text) = self.next_message().await {
                return text.as_str().to_string();
            }
        }
    }

    /// Wait until an upstream connection ends.
    pub async fn wait_closed(&mut self) {
        timeout(WAIT, self.closed.recv())
            .await
            .expect("upstream connection should close")
            .expect("closed channel open");
    }

    /// Close every open upstream connection from the mock's side.
    pub fn close_connections(&self) {
        let _ = self.shutdown.send(());
    }

    /// True if nothing arrives within `window`.
    pub async fn is_quiet_for(&mut self, window: Duration) -> bool {
        timeout(window, self.received.recv()).await.is_err()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    received: mpsc::UnboundedSender<Message>,
    closed: mpsc::UnboundedSender<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let capture = handshakes.clone();
    let ws = accept_hdr_async(stream, move |req: &Request, response: Response| {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        capture.lock().expect("handshake lock").push(Handshake {
            authorization: header("authorization"),
            beta: header("openai-beta"),
            path: req.uri().path().to_string(),
            query: req.uri().query().unwrap_or_default().to_string(),
        });
        Ok(response)
    })
    .await;

    let Ok(ws) = ws else {
        let _ = closed.send(());
        return;
    };
    let (mut write, mut read) = ws.split();

    let greeting = json!({
        "type": "session.created",
        "event_id": "event_mock_1",
        "session": {"id": "sess_mock", "object": "realtime.session"}
    });
    if write
        .send(Message::Text(greeting.to_string().into()))
        .await
        .is_err()
    {
        let _ = closed.send(());
        return;
    }

    loop {
        let msg = tokio::select! {
            msg = read.next() => msg,
            _ = shutdown.recv() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        };
        let Some(msg) = msg else { break };
        match msg {
            Ok(Message::Text(text)) => {
                let frame_type = serde_json::from_str::<Value>(text.as_str())
                    .ok()
                    .and_then(|v| v["type"].as_str().map(str::to_string))
                    .unwrap_or_default();

                if frame_type == "mock.close" {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }

                let _ = received.send(Message::Text(text));

                if frame_type == "response.create" && send_scripted_response(&mut write).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                let _ = received.send(Message::Binary(data));
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    let _ = closed.send(());
}

async fn send_scripted_response<S>(write: &mut S) -> Result<(), S::Error>
where
    S: futures::Sink<Message> + Unpin,
{
    let audio = codec::encode(&vec![0.1; SCRIPTED_AUDIO_SAMPLES]);
    let frames = [
        json!({"type": "response.created", "response": {"id": "resp_1"}}),
        json!({"type": "response.audio.delta", "response_id": "resp_1", "delta": audio}),
        json!({"type": "response.audio_transcript.delta", "response_id": "resp_1", "delta": "Hi"}),
        json!({"type": "response.audio_transcript.delta", "response_id": "resp_1", "delta": " there"}),
        json!({"type": "response.audio_transcript.done", "response_id": "resp_1", "transcript": SCRIPTED_TRANSCRIPT}),
        json!({"type": "response.audio.done", "response_id": "resp_1"}),
    ];
    for frame in frames {
        write.send(Message::Text(frame.to_string().into())).await?;
    }
    Ok(())
}

/// Upstream that accepts TCP connections but never completes the handshake.
pub struct StalledUpstream {
    pub addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<String>,
    abandoned: mpsc::UnboundedReceiver<()>,
    task: JoinHandle<()>,
}

impl StalledUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("stalled upstream should bind");
        let addr = listener.local_addr().expect("local addr should be available");
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (abandoned_tx, abandoned) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(hold_handshake(
                    stream,
                    requests_tx.clone(),
                    abandoned_tx.clone(),
                ));
            }
        });

        Self {
            addr,
            requests,
            abandoned,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    /// Head of the next upgrade request received.
    pub async fn next_request(&mut self) -> String {
        timeout(WAIT, self.requests.recv())
            .await
            .expect("stalled upstream should receive a handshake")
            .expect("requests channel open")
    }

    /// Wait until the peer drops a connection whose handshake is pending.
    pub async fn wait_abandoned(&mut self) {
        timeout(WAIT, self.abandoned.recv())
            .await
            .expect("pending handshake should be dropped")
            .expect("abandoned channel open");
    }
}

impl Drop for StalledUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn hold_handshake(
    mut stream: TcpStream,
    requests: mpsc::UnboundedSender<String>,
    abandoned: mpsc::UnboundedSender<()>,
) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    let mut reported = false;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                head.extend_from_slice(&buf[..n]);
                if !reported && head.windows(4).any(|w| w == b"\r\n\r\n") {
                    reported = true;
                    let _ = requests.send(String::from_utf8_lossy(&head).into_owned());
                }
            }
        }
    }
    let _ = abandoned.send(());
}

/// Relay configuration pointing at `upstream_url`.
pub fn relay_config(upstream_url: &str) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        upstream_url: upstream_url.to_string(),
        upstream_connect_timeout_seconds: 2,
        ..Default::default()
    }
}

/// Serve the relay on an ephemeral port and return its address.
pub async fn spawn_relay(config: ServerConfig) -> (SocketAddr, Arc<AppState>) {
    let state = AppState::new(config).await;
    let app = routes::create_app_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("relay should bind");
    let addr = listener.local_addr().expect("local addr should be available");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("relay server should run");
    });
    (addr, state)
}

pub fn relay_url(addr: SocketAddr) -> String {
    format!("ws://{addr}/realtime")
}

/// Port with nothing listening on it.
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}
