//! Configuration module for the relay server
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use waav_relay::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::upstream::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_INSTRUCTIONS, DEFAULT_REALTIME_MODEL,
    DEFAULT_TEMPERATURE, DEFAULT_TRANSCRIPTION_MODEL, DEFAULT_VAD_PREFIX_PADDING_MS,
    DEFAULT_VAD_SILENCE_DURATION_MS, DEFAULT_VAD_THRESHOLD, OPENAI_REALTIME_URL, RealtimeVoice,
    SessionSettings, UpstreamConfig,
};

/// Default idle window before a relay session is closed, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// Contains all configuration needed to run the relay server, including:
/// - Server settings (host, port, TLS)
/// - Upstream endpoint settings
/// - Session settings injected on every relayed session
/// - Security settings (CORS, rate limiting, connection limits)
///
/// Upstream credentials are never part of the server configuration; every
/// client supplies its own in the first frame of its session.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Upstream settings
    /// Realtime WebSocket endpoint (default: OpenAI Realtime)
    pub upstream_url: String,
    /// Model passed as the `model` query parameter
    pub upstream_model: String,
    /// Upstream handshake timeout
    pub upstream_connect_timeout_seconds: u64,

    // Session settings
    /// Voice requested for assistant audio
    pub voice: RealtimeVoice,
    /// System instructions injected with `session.update`
    pub instructions: String,
    /// Transcription sub-model for user audio
    pub transcription_model: String,
    /// Response temperature
    pub temperature: f32,
    /// Server VAD activation threshold (0.0 - 1.0)
    pub vad_threshold: f32,
    /// Audio kept before detected speech (ms)
    pub vad_prefix_padding_ms: u32,
    /// Silence that ends a user turn (ms)
    pub vad_silence_duration_ms: u32,
    /// Close sessions with no traffic for this long
    /// Default: 300
    pub idle_timeout_seconds: u64,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,

    // Rate limiting configuration
    /// Maximum requests per second per IP address
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,

    // Connection limits
    /// Maximum concurrent WebSocket connections
    /// Default: None (unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    /// Default: 100
    pub max_connections_per_ip: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            upstream_url: OPENAI_REALTIME_URL.to_string(),
            upstream_model: DEFAULT_REALTIME_MODEL.to_string(),
            upstream_connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECS,
            voice: RealtimeVoice::default(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            vad_prefix_padding_ms: DEFAULT_VAD_PREFIX_PADDING_MS,
            vad_silence_duration_ms: DEFAULT_VAD_SILENCE_DURATION_MS,
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECS,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables only
    ///
    /// The .env file is loaded in main.rs before this is called, so its values
    /// are visible here as regular environment variables.
    ///
    /// # Errors
    /// Returns an error if a variable has an invalid format or validation fails.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// After loading and merging, performs validation on the final configuration.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Upstream connection settings for new sessions
    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            url: self.upstream_url.clone(),
            model: self.upstream_model.clone(),
            connect_timeout: Duration::from_secs(self.upstream_connect_timeout_seconds),
        }
    }

    /// Settings carried by the injected `session.update`
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            instructions: self.instructions.clone(),
            voice: self.voice,
            transcription_model: self.transcription_model.clone(),
            temperature: self.temperature,
            vad_threshold: self.vad_threshold,
            vad_prefix_padding_ms: self.vad_prefix_padding_ms,
            vad_silence_duration_ms: self.vad_silence_duration_ms,
        }
    }
}
