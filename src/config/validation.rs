use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream_config(config)?;
    validate_client_config(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if server.body_limit_bytes == 0 {
        return Err(validation_err("server.body_limit_bytes must be greater than 0"));
    }
    if server.runtime_worker_threads == Some(0) {
        return Err(validation_err(
            "server.runtime_worker_threads must be greater than 0 when set",
        ));
    }
    if server.runtime_max_blocking_threads == Some(0) {
        return Err(validation_err(
            "server.runtime_max_blocking_threads must be greater than 0 when set",
        ));
    }
    Ok(())
}

fn validate_upstream_config(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    validate_http_url("upstream.api_url", &upstream.api_url)?;
    if upstream.default_model.trim().is_empty() {
        return Err(validation_err("upstream.default_model cannot be empty"));
    }
    if !(0.0..=2.0).contains(&upstream.temperature) {
        return Err(validation_err(
            "upstream.temperature must be between 0.0 and 2.0",
        ));
    }
    if upstream.max_tokens == 0 {
        return Err(validation_err("upstream.max_tokens must be greater than 0"));
    }
    if upstream.api_key.is_none() && upstream.api_key_env.trim().is_empty() {
        return Err(validation_err(
            "either upstream.api_key or upstream.api_key_env must be set",
        ));
    }
    if let Some(proxy) = upstream.proxy.as_deref() {
        let parsed = url::Url::parse(proxy)
            .map_err(|e| validation_err(format!("upstream.proxy is not a valid URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
            return Err(validation_err(format!(
                "upstream.proxy has unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
    }
    Ok(())
}

fn validate_client_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_http_url("client.relay_url", &config.client.relay_url)
}

fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value)
        .map_err(|e| validation_err(format!("{field} is not a valid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &[
    "DEBUG", "INFO", "WARNING", "WARN", "ERROR", "CRITICAL", "TRACE", "DISABLED",
];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "features.log_level '{}' is invalid. Must be one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
