use super::ServerConfig;

/// Validate a merged configuration.
///
/// # Errors
/// Returns a descriptive error for the first invalid setting found.
pub(super) fn validate_config(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_upstream_url(&config.upstream_url)?;
    validate_session(config)?;
    validate_limits(config)?;
    validate_tls(config)?;
    Ok(())
}

fn validate_upstream_url(raw: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = url::Url::parse(raw).map_err(|e| format!("Invalid upstream URL '{raw}': {e}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(format!(
            "Upstream URL must use ws:// or wss://, got '{other}://'"
        )
        .into()),
    }
}

fn validate_session(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !(0.0..=1.0).contains(&config.vad_threshold) {
        return Err(format!(
            "VAD threshold must be between 0.0 and 1.0, got {}",
            config.vad_threshold
        )
        .into());
    }
    if !(0.6..=1.2).contains(&config.temperature) {
        return Err(format!(
            "Temperature must be between 0.6 and 1.2, got {}",
            config.temperature
        )
        .into());
    }
    if config.transcription_model.trim().is_empty() {
        return Err("Transcription model must not be empty".into());
    }
    if config.upstream_model.trim().is_empty() {
        return Err("Upstream model must not be empty".into());
    }
    Ok(())
}

fn validate_limits(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.idle_timeout_seconds == 0 {
        return Err("Idle timeout must be greater than zero".into());
    }
    if config.upstream_connect_timeout_seconds == 0 {
        return Err("Upstream connect timeout must be greater than zero".into());
    }
    if config.rate_limit_requests_per_second == 0 {
        return Err("Rate limit must allow at least one request per second".into());
    }
    if config.rate_limit_burst_size == 0 {
        return Err("Rate limit burst size must be greater than zero".into());
    }
    if config.max_connections_per_ip == 0 {
        return Err("Per-IP connection limit must be greater than zero".into());
    }
    if config.max_websocket_connections == Some(0) {
        return Err("Global connection limit must be greater than zero".into());
    }
    Ok(())
}

fn validate_tls(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(tls) = &config.tls {
        if !tls.cert_path.exists() {
            return Err(format!(
                "TLS certificate file not found: {}",
                tls.cert_path.display()
            )
            .into());
        }
        if !tls.key_path.exists() {
            return Err(format!("TLS key file not found: {}", tls.key_path.display()).into());
        }
    }
    Ok(())
}
