//! Configuration validation rules.

use super::schema::{Config, EndpointConfig};

/// Smallest heartbeat the outbound loop can keep alive with its one-second pump
pub const MIN_HEARTBEAT_S: u64 = 2;

/// Largest heartbeat a broker can negotiate (an unsigned 16-bit field)
pub const MAX_HEARTBEAT_S: u64 = u16::MAX as u64;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["text", "json"];

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    validate_endpoint("upstream", &config.upstream, &mut errors);
    validate_endpoint("downstream", &config.downstream, &mut errors);

    if config.upstream.queue == config.downstream.queue
        && config.upstream.host == config.downstream.host
    {
        errors.push(format!(
            "upstream.queue and downstream.queue must differ on the same host (both '{}')",
            config.upstream.queue
        ));
    }

    if !LOG_LEVELS.contains(&config.logging.level.to_lowercase().as_str()) {
        errors.push(format!(
            "logging.level must be one of {}",
            LOG_LEVELS.join(", ")
        ));
    }
    if !LOG_FORMATS.contains(&config.logging.format.to_lowercase().as_str()) {
        errors.push("logging.format must be text or json".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}

fn validate_endpoint(name: &str, endpoint: &EndpointConfig, errors: &mut Vec<String>) {
    if endpoint.host.trim().is_empty() {
        errors.push(format!("{}.host must not be empty", name));
    }
    if endpoint.port == 0 {
        errors.push(format!("{}.port must be > 0", name));
    }
    if endpoint.virtual_host.trim().is_empty() {
        errors.push(format!("{}.virtual_host must not be empty", name));
    }
    if endpoint.username.trim().is_empty() {
        errors.push(format!("{}.username must not be empty", name));
    }
    if endpoint.queue.trim().is_empty() {
        errors.push(format!("{}.queue must not be empty", name));
    }
    if let Some(secs) = endpoint.heartbeat_s {
        if secs != 0 && !(MIN_HEARTBEAT_S..=MAX_HEARTBEAT_S).contains(&secs) {
            errors.push(format!(
                "{}.heartbeat_s must be 0 (disabled) or between {} and {}",
                name, MIN_HEARTBEAT_S, MAX_HEARTBEAT_S
            ));
        }
    }
}
