//! Relay integration tests
//!
//! Real sockets end to end: a tokio-tungstenite client talks to the relay,
//! which talks to the mock realtime API.

mod mock_upstream;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use mock_upstream::{
    MockUpstream, StalledUpstream, WAIT, relay_config, relay_url, spawn_relay, unused_port,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect_client(addr: std::net::SocketAddr) -> ClientSocket {
    let (socket, _) = connect_async(relay_url(addr))
        .await
        .expect("client should connect to relay");
    socket
}

async fn send_json(socket: &mut ClientSocket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("client send");
}

/// Next text frame from the relay, parsed.
async fn recv_json(socket: &mut ClientSocket) -> Value {
    loop {
        let msg = timeout(WAIT, socket.next())
            .await
            .expect("relay should answer")
            .expect("relay stream open")
            .expect("relay frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("relay frames are JSON");
        }
    }
}

/// Wait for the relay to close the client connection.
async fn expect_closed(socket: &mut ClientSocket) {
    let closed = timeout(WAIT, async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "relay should close the client connection");
}

/// Authenticate and wait until the relay forwarded `session.created`.
async fn authenticate(socket: &mut ClientSocket, upstream: &mut MockUpstream, key: &str) {
    send_json(socket, json!({"type": "auth", "apiKey": key})).await;

    let connected = recv_json(socket).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["message"], "Connected to realtime API");

    let created = recv_json(socket).await;
    assert_eq!(created["type"], "session.created");

    let update = upstream.next_json().await;
    assert_eq!(update["type"], "session.update");
}

#[tokio::test]
async fn test_handshake_configures_session_once() {
    let mut upstream = MockUpstream::start().await;
    let (addr, _state) = spawn_relay(relay_config(&upstream.url())).await;
    let mut client = connect_client(addr).await;

    authenticate(&mut client, &mut upstream, "sk-test123").await;

    let handshakes = upstream.handshakes();
    assert_eq!(handshakes.len(), 1);
    assert_eq!(handshakes[0].authorization, "Bearer sk-test123");
    assert_eq!(handshakes[0].beta, "realtime=v1");
    assert_eq!(handshakes[0].path, "/v1/realtime");
    assert!(handshakes[0].query.starts_with("model="));

    // Nothing but the one session.update went upstream
    assert!(upstream.is_quiet_for(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_session_update_carries_configured_settings() {
    let mut upstream = MockUpstream::start().await;
    let mut config = relay_config(&upstream.url());
    config.voice = waav_relay::core::upstream::RealtimeVoice::Sage;
    config.vad_silence_duration_ms = 700;
    let (addr, _state) = spawn_relay(config).await;
    let mut client = connect_client(addr).await;

    send_json(&mut client, json!({"type": "auth", "apiKey": "sk-test123"})).await;
    let update = upstream.next_json().await;

    assert_eq!(update["type"], "session.update");
    let session = &update["session"];
    assert_eq!(session["voice"], "sage");
    assert_eq!(session["modalities"], json!(["text", "audio"]));
    assert_eq!(session["input_audio_format"], "pcm16");
    assert_eq!(session["output_audio_format"], "pcm16");
    assert_eq!(session["turn_detection"]["type"], "server_vad");
    assert_eq!(session["turn_detection"]["silence_duration_ms"], 700);
    assert_eq!(session["max_response_output_tokens"], "inf");
}

#[tokio::test]
async fn test_frames_before_auth_are_rejected() {
    let mut upstream = MockUpstream::start().await;
    let (addr, _state) = spawn_relay(relay_config(&upstream.url())).await;
    let mut client = connect_client(addr).await;

    send_json(&mut client, json!({"type": "response.create"})).await;
    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(
        error["message"],
        "Not authenticated. Send an auth frame with your API key first."
    );
    assert_eq!(upstream.connection_count(), 0);

    send_json(&mut client, json!({"type": "auth"})).await;
    let error = recv_json(&mut client).await;
    assert_eq!(error["message"], "Missing API key in auth frame");

    client
        .send(Message::Text("not json".into()))
        .await
        .expect("client send");
    let error = recv_json(&mut client).await;
    assert!(
        error["message"]
            .as_str()
            .unwrap_or_default()
            .starts_with("Invalid frame")
    );

    // The session is still open and accepts a valid auth
    authenticate(&mut client, &mut upstream, "sk-late").await;
    assert_eq!(upstream.connection_count(), 1);
}

#[tokio::test]
async fn test_audio_append_forwarded_verbatim() {
    let mut upstream = MockUpstream::start().await;
    let (addr, _state) = spawn_relay(relay_config(&upstream.url())).await;
    let mut client = connect_client(addr).await;
    authenticate(&mut client, &mut upstream, "sk-test123").await;

    let frame = r#"{"type":"input_audio_buffer.append","audio":"AAAA"}"#;
    client
        .send(Message::Text(frame.into()))
        .await
        .expect("client send");
    assert_eq!(upstream.next_text().await, frame);

    client
        .send(Message::Binary(vec![1u8, 2, 3].into()))
        .await
        .expect("client send");
    match upstream.next_message().await {
        Message::Binary(data) => assert_eq!(data.as_ref(), &[1u8, 2, 3]),
        other => panic!("expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_upstream_responses_reach_client() {
    let mut upstream = MockUpstream::start().await;
    let (addr, _state) = spawn_relay(relay_config(&upstream.url())).await;
    let mut client = connect_client(addr).await;
    authenticate(&mut client, &mut upstream, "sk-test123").await;

    send_json(&mut client, json!({"type": "response.create"})).await;
    assert_eq!(upstream.next_json().await["type"], "response.create");

    let mut types = Vec::new();
    for _ in 0..6 {
        types.push(recv_json(&mut client).await["type"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(
        types,
        [
            "response.created",
            "response.audio.delta",
            "response.audio_transcript.delta",
            "response.audio_transcript.delta",
            "response.audio_transcript.done",
            "response.audio.done",
        ]
    );
}

#[tokio::test]
async fn test_second_auth_is_rejected() {
    let mut upstream = MockUpstream::start().await;
    let (addr, _state) = spawn_relay(relay_config(&upstream.url())).await;
    let mut client = connect_client(addr).await;
    authenticate(&mut client, &mut upstream, "sk-first").await;

    send_json(&mut client, json!({"type": "auth", "apiKey": "sk-second"})).await;
    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(
        error["message"],
        "Already authenticated. Only the first auth frame is accepted."
    );

    // The credential never reaches upstream and no second connection is made
    assert!(upstream.is_quiet_for(Duration::from_millis(200)).await);
    let handshakes = upstream.handshakes();
    assert_eq!(handshakes.len(), 1);
    assert_eq!(handshakes[0].authorization, "Bearer sk-first");
}

#[tokio::test]
async fn test_binary_before_relaying_is_rejected() {
    let upstream = MockUpstream::start().await;
    let (addr, _state) = spawn_relay(relay_config(&upstream.url())).await;
    let mut client = connect_client(addr).await;

    client
        .send(Message::Binary(vec![0u8; 4].into()))
        .await
        .expect("client send");
    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(upstream.connection_count(), 0);
}

#[tokio::test]
async fn test_upstream_close_closes_client() {
    let mut upstream = MockUpstream::start().await;
    let (addr, state) = spawn_relay(relay_config(&upstream.url())).await;
    let mut client = connect_client(addr).await;
    authenticate(&mut client, &mut upstream, "sk-test123").await;

    send_json(&mut client, json!({"type": "mock.close"})).await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Upstream connection closed");
    expect_closed(&mut client).await;

    // The connection slot is released once the session ends
    timeout(WAIT, async {
        while state.ws_connection_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection slot should be released");
}

#[tokio::test]
async fn test_client_close_closes_upstream() {
    let mut upstream = MockUpstream::start().await;
    let (addr, _state) = spawn_relay(relay_config(&upstream.url())).await;
    let mut client = connect_client(addr).await;
    authenticate(&mut client, &mut upstream, "sk-test123").await;

    client.close(None).await.expect("client close");
    upstream.wait_closed().await;
}

#[tokio::test]
async fn test_unreachable_upstream_fails_session() {
    let upstream_url = format!("ws://127.0.0.1:{}/v1/realtime", unused_port());
    let (addr, _state) = spawn_relay(relay_config(&upstream_url)).await;
    let mut client = connect_client(addr).await;

    send_json(&mut client, json!({"type": "auth", "apiKey": "sk-test123"})).await;
    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert!(
        error["message"]
            .as_str()
            .unwrap_or_default()
            .starts_with("Upstream connection error:")
    );
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_frames_during_connect_are_flushed_in_order() {
    let mut upstream = MockUpstream::start().await;
    let (addr, _state) = spawn_relay(relay_config(&upstream.url())).await;
    let mut client = connect_client(addr).await;

    // Sent back to back, before upstream can possibly be open
    send_json(&mut client, json!({"type": "auth", "apiKey": "sk-test123"})).await;
    send_json(&mut client, json!({"type": "conversation.item.create", "item": {"type": "message"}})).await;
    send_json(&mut client, json!({"type": "response.create"})).await;

    let mut types = Vec::new();
    for _ in 0..3 {
        types.push(upstream.next_json().await["type"].as_str().unwrap_or_default().to_string());
    }
    // Held frames go out as soon as upstream opens, ahead of the session.update
    // that follows session.created.
    assert_eq!(
        types,
        ["conversation.item.create", "response.create", "session.update"]
    );
}

#[tokio::test]
async fn test_per_ip_limit_rejects_upgrade() {
    let upstream = MockUpstream::start().await;
    let mut config = relay_config(&upstream.url());
    config.max_connections_per_ip = 1;
    let (addr, _state) = spawn_relay(config).await;

    let _first = connect_client(addr).await;
    let second = connect_async(relay_url(addr)).await;
    assert!(second.is_err(), "second connection from the same IP should be refused");
}

/// A client leaving while the upstream handshake is pending cancels it.
#[tokio::test]
async fn test_client_close_cancels_pending_upstream_connect() {
    let mut upstream = StalledUpstream::start().await;
    let mut config = relay_config(&upstream.url());
    // Far beyond WAIT, so only cancellation can end the handshake in time
    config.upstream_connect_timeout_seconds = 30;
    let (addr, state) = spawn_relay(config).await;
    let mut client = connect_client(addr).await;

    send_json(&mut client, json!({"type": "auth", "apiKey": "sk-test123"})).await;
    send_json(&mut client, json!({"type": "response.create"})).await;

    let request = upstream.next_request().await;
    assert!(request.starts_with("GET /v1/realtime?model="));
    assert!(request.contains("Bearer sk-test123"));

    client.close(None).await.expect("client close");
    upstream.wait_abandoned().await;

    timeout(WAIT, async {
        while state.ws_connection_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection slot should be released");
}

/// Upgrade requests the WebSocket extractor refuses must not keep a slot.
#[tokio::test]
async fn test_malformed_upgrades_do_not_hold_slots() {
    let upstream = MockUpstream::start().await;
    let mut config = relay_config(&upstream.url());
    config.max_connections_per_ip = 2;
    let (addr, state) = spawn_relay(config).await;

    for _ in 0..3 {
        let mut stream = TcpStream::connect(addr).await.expect("tcp connect");
        // No Sec-WebSocket-Key, so the upgrade is rejected with 400
        let request = format!(
            "GET /realtime HTTP/1.1\r\nHost: {addr}\r\nConnection: Upgrade\r\n\
             Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\r\n"
        );
        stream
            .write_all(request.as_bytes())
            .await
            .expect("write request");

        let mut buf = vec![0u8; 1024];
        let n = timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("relay should answer")
            .expect("read response");
        let head = String::from_utf8_lossy(&buf[..n]);
        assert!(
            head.starts_with("HTTP/1.1 400"),
            "unexpected response: {head}"
        );
    }

    assert_eq!(state.ws_connection_count(), 0);

    // Well-formed sessions from the same address are still admitted
    let _first = connect_client(addr).await;
    let _second = connect_client(addr).await;
    assert_eq!(state.ws_connection_count(), 2);
}

#[tokio::test]
async fn test_idle_session_is_closed() {
    let mut upstream = MockUpstream::start().await;
    let mut config = relay_config(&upstream.url());
    config.idle_timeout_seconds = 1;
    let (addr, _state) = spawn_relay(config).await;
    let mut client = connect_client(addr).await;
    authenticate(&mut client, &mut upstream, "sk-test123").await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Connection closed due to inactivity");
    expect_closed(&mut client).await;
    upstream.wait_closed().await;
}
