/// Configuration management for the conductor daemon
///
/// Handles server binding, the durable store location, and the tuning knobs of
/// each component. Every value has a built-in default that can be overridden
/// through environment variables.

use crate::bridge::BridgeConfig;
use crate::channel::ChannelConfig;
use crate::dispatch::DispatcherConfig;
use crate::runtime::EngineConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub channel: ChannelConfig,
    pub dispatcher: DispatcherConfig,
    pub engine: EngineConfig,
    pub bridge: BridgeConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection string of the durable workflow store
    pub url: String,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        let mut channel = ChannelConfig::default();
        if let Some(attempts) = env_parse::<u32>("CONDUCTOR_MAX_RECONNECT_ATTEMPTS") {
            channel.max_reconnect_attempts = Some(attempts);
        }
        if let Some(ms) = env_parse::<u64>("CONDUCTOR_OPERATION_TIMEOUT_MS") {
            channel.operation_timeout = Duration::from_millis(ms);
        }

        let mut engine = EngineConfig::default();
        if let Some(secs) = env_parse::<u64>("CONDUCTOR_TICK_INTERVAL_SECS") {
            engine.tick_interval = Duration::from_secs(secs.max(1));
        }

        let mut dispatcher = DispatcherConfig::default();
        if let Some(capacity) = env_parse::<usize>("CONDUCTOR_QUEUE_CAPACITY") {
            dispatcher.queue_capacity = capacity;
        }

        Self {
            server: ServerConfig {
                host: std::env::var("CONDUCTOR_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("CONDUCTOR_PORT").unwrap_or(3004),
            },
            database: DatabaseConfig {
                url: std::env::var("CONDUCTOR_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/conductor.db".to_string()),
            },
            channel,
            dispatcher,
            engine,
            bridge: BridgeConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("⚠️ Ignoring unparsable {}={}", key, raw);
            None
        }
    }
}
