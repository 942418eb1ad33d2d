use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ServerConfig, TlsConfig};
use crate::core::upstream::RealtimeVoice;

/// Read an environment variable, treating empty values as unset.
pub(super) fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, keeping `default` when unset.
pub(super) fn parse_env<T>(name: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| format!("Invalid {name} value '{raw}': {e}").into()),
        None => Ok(default),
    }
}

impl ServerConfig {
    /// Build a configuration from environment variables over defaults.
    pub(super) fn load_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = ServerConfig::default();

        let tls = match (env_var("TLS_CERT_PATH"), env_var("TLS_KEY_PATH")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => {
                return Err(
                    "Both TLS_CERT_PATH and TLS_KEY_PATH must be set to enable TLS".into(),
                );
            }
        };

        let max_websocket_connections = match env_var("MAX_WEBSOCKET_CONNECTIONS") {
            Some(raw) => Some(raw.trim().parse::<usize>().map_err(|e| {
                format!("Invalid MAX_WEBSOCKET_CONNECTIONS value '{raw}': {e}")
            })?),
            None => defaults.max_websocket_connections,
        };

        Ok(ServerConfig {
            host: env_var("HOST").unwrap_or(defaults.host),
            port: parse_env("PORT", defaults.port)?,
            tls,
            upstream_url: env_var("UPSTREAM_URL").unwrap_or(defaults.upstream_url),
            upstream_model: env_var("UPSTREAM_MODEL").unwrap_or(defaults.upstream_model),
            upstream_connect_timeout_seconds: parse_env(
                "UPSTREAM_CONNECT_TIMEOUT_SECONDS",
                defaults.upstream_connect_timeout_seconds,
            )?,
            voice: env_var("RELAY_VOICE")
                .map(|v| RealtimeVoice::from_str_or_default(&v))
                .unwrap_or(defaults.voice),
            instructions: env_var("RELAY_INSTRUCTIONS").unwrap_or(defaults.instructions),
            transcription_model: env_var("RELAY_TRANSCRIPTION_MODEL")
                .unwrap_or(defaults.transcription_model),
            temperature: parse_env("RELAY_TEMPERATURE", defaults.temperature)?,
            vad_threshold: parse_env("VAD_THRESHOLD", defaults.vad_threshold)?,
            vad_prefix_padding_ms: parse_env(
                "VAD_PREFIX_PADDING_MS",
                defaults.vad_prefix_padding_ms,
            )?,
            vad_silence_duration_ms: parse_env(
                "VAD_SILENCE_DURATION_MS",
                defaults.vad_silence_duration_ms,
            )?,
            idle_timeout_seconds: parse_env("IDLE_TIMEOUT_SECONDS", defaults.idle_timeout_seconds)?,
            cors_allowed_origins: env_var("CORS_ALLOWED_ORIGINS"),
            rate_limit_requests_per_second: parse_env(
                "RATE_LIMIT_REQUESTS_PER_SECOND",
                defaults.rate_limit_requests_per_second,
            )?,
            rate_limit_burst_size: parse_env(
                "RATE_LIMIT_BURST_SIZE",
                defaults.rate_limit_burst_size,
            )?,
            max_websocket_connections,
            max_connections_per_ip: parse_env(
                "MAX_CONNECTIONS_PER_IP",
                defaults.max_connections_per_ip,
            )?,
        })
    }
}
