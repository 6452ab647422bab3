//! Configuration validation.
//!
//! Validates numeric ranges, the heartbeat invariant and endpoint URLs,
//! collecting every problem before reporting.

use crate::schema::RallyConfig;
use rally_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &RallyConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    // Signaling
    validate_ws_url(&mut errors, "signaling.url", &config.signaling.url);
    validate_range(
        &mut errors,
        "signaling.max_reconnect_attempts",
        u64::from(config.signaling.max_reconnect_attempts),
        0,
        50,
    );
    validate_range(
        &mut errors,
        "signaling.reconnect_base_delay_ms",
        config.signaling.reconnect_base_delay_ms,
        100,
        60_000,
    );
    validate_range(
        &mut errors,
        "signaling.connect_timeout_secs",
        config.signaling.connect_timeout_secs,
        1,
        120,
    );

    // Heartbeat
    if config.heartbeat.enabled {
        validate_range(
            &mut errors,
            "heartbeat.interval_ms",
            config.heartbeat.interval_ms,
            100,
            600_000,
        );
        if config.heartbeat.idle_timeout_ms <= config.heartbeat.interval_ms {
            errors.push(format!(
                "heartbeat.idle_timeout_ms = {} must be greater than heartbeat.interval_ms = {}",
                config.heartbeat.idle_timeout_ms, config.heartbeat.interval_ms
            ));
        }
    }

    // ICE
    for (i, url) in config.ice.stun_servers.iter().enumerate() {
        if !(url.starts_with("stun:") || url.starts_with("stuns:")) {
            errors.push(format!("ice.stun_servers[{i}] = {url:?} is not a stun: URL"));
        }
    }
    for (i, turn) in config.ice.turn_servers.iter().enumerate() {
        if !(turn.url.starts_with("turn:") || turn.url.starts_with("turns:")) {
            errors.push(format!(
                "ice.turn_servers[{i}].url = {:?} is not a turn: URL",
                turn.url
            ));
        }
    }

    // Relay
    validate_ws_url(&mut errors, "relay.url", &config.relay.url);
    if config.relay.channel.is_empty() {
        errors.push("relay.channel must not be empty".into());
    }
    if config.relay.reconnect_delay_secs == 0 {
        errors.push("relay.reconnect_delay_secs must be at least 1".into());
    }
    if config.relay.reconnect_delay_secs > config.relay.max_reconnect_delay_secs {
        errors.push(format!(
            "relay.reconnect_delay_secs = {} exceeds relay.max_reconnect_delay_secs = {}",
            config.relay.reconnect_delay_secs, config.relay.max_reconnect_delay_secs
        ));
    }

    if let Some(id) = &config.session.id {
        if id.trim().is_empty() {
            errors.push("session.id must not be blank".into());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}

fn validate_range(errors: &mut Vec<String>, name: &str, value: u64, min: u64, max: u64) {
    if value < min || value > max {
        errors.push(format!("{name} = {value} is out of range [{min}, {max}]"));
    }
}

fn validate_ws_url(errors: &mut Vec<String>, name: &str, url: &str) {
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        errors.push(format!("{name} = {url:?} must be a ws:// or wss:// URL"));
    }
}
