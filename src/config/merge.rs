use std::path::PathBuf;

use super::yaml::YamlConfig;
use super::{ServerConfig, TlsConfig};
use crate::core::upstream::RealtimeVoice;

/// Build the final configuration: environment first, YAML values on top.
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = ServerConfig::load_env()?;

    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
        if let Some(tls) = server.tls {
            match (tls.cert_path, tls.key_path) {
                (Some(cert), Some(key)) => {
                    config.tls = Some(TlsConfig {
                        cert_path: PathBuf::from(cert),
                        key_path: PathBuf::from(key),
                    });
                }
                (None, None) => {}
                _ => {
                    return Err(
                        "server.tls requires both cert_path and key_path to be set".into(),
                    );
                }
            }
        }
    }

    if let Some(upstream) = yaml.upstream {
        if let Some(url) = upstream.url {
            config.upstream_url = url;
        }
        if let Some(model) = upstream.model {
            config.upstream_model = model;
        }
        if let Some(timeout) = upstream.connect_timeout_seconds {
            config.upstream_connect_timeout_seconds = timeout;
        }
    }

    if let Some(session) = yaml.session {
        if let Some(voice) = session.voice {
            config.voice = RealtimeVoice::from_str_or_default(&voice);
        }
        if let Some(instructions) = session.instructions {
            config.instructions = instructions;
        }
        if let Some(model) = session.transcription_model {
            config.transcription_model = model;
        }
        if let Some(temperature) = session.temperature {
            config.temperature = temperature;
        }
        if let Some(threshold) = session.vad_threshold {
            config.vad_threshold = threshold;
        }
        if let Some(padding) = session.vad_prefix_padding_ms {
            config.vad_prefix_padding_ms = padding;
        }
        if let Some(silence) = session.vad_silence_duration_ms {
            config.vad_silence_duration_ms = silence;
        }
        if let Some(idle) = session.idle_timeout_seconds {
            config.idle_timeout_seconds = idle;
        }
    }

    if let Some(security) = yaml.security {
        if security.cors_allowed_origins.is_some() {
            config.cors_allowed_origins = security.cors_allowed_origins;
        }
        if let Some(rps) = security.rate_limit_requests_per_second {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = security.rate_limit_burst_size {
            config.rate_limit_burst_size = burst;
        }
        if security.max_websocket_connections.is_some() {
            config.max_websocket_connections = security.max_websocket_connections;
        }
        if let Some(per_ip) = security.max_connections_per_ip {
            config.max_connections_per_ip = per_ip;
        }
    }

    Ok(config)
}
