//! Outbound WebSocket connection to the realtime API.

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use super::config::{OPENAI_BETA_HEADER_VALUE, UpstreamConfig};

/// Stream type of an open upstream connection.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Failures opening the upstream connection.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid upstream request: {0}")]
    Request(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection timed out after {0}s")]
    Timeout(u64),
}

/// Build the handshake request carrying the bearer credential and beta marker.
pub fn build_upstream_request(
    config: &UpstreamConfig,
    api_key: &str,
) -> Result<Request, UpstreamError> {
    let endpoint = config
        .endpoint()
        .map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;

    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| UpstreamError::Request(e.to_string()))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|_| UpstreamError::Request("credential is not a valid header value".into()))?;
    let headers = request.headers_mut();
    headers.insert("Authorization", bearer);
    headers.insert("OpenAI-Beta", HeaderValue::from_static(OPENAI_BETA_HEADER_VALUE));

    Ok(request)
}

/// Open the upstream WebSocket, bounded by the configured timeout.
pub async fn connect_upstream(
    config: &UpstreamConfig,
    api_key: &str,
) -> Result<UpstreamSocket, UpstreamError> {
    let request = build_upstream_request(config, api_key)?;
    debug!(url = %request.uri(), "Connecting to realtime API");

    let connect = connect_async(request);
    let (socket, response) = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| UpstreamError::Timeout(config.connect_timeout.as_secs()))?
        .map_err(|e| UpstreamError::Connect(e.to_string()))?;

    info!(status = %response.status(), model = %config.model, "Connected to realtime API");
    Ok(socket)
}
