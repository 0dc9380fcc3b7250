//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use enclave_engine::EngineConfig;
use enclave_shared::constants::DEFAULT_HTTP_PORT;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./enclave.db`
    pub database_path: PathBuf,

    /// Sustained messages per second one identity may send.
    /// Env: `SEND_RATE`
    /// Default: `5`
    pub send_rate: f64,

    /// Messages one identity may send in a burst.
    /// Env: `SEND_BURST`
    /// Default: `20`
    pub send_burst: f64,

    /// Env: `HISTORY_LIMIT`, `MAX_HISTORY_LIMIT`, `MAX_MESSAGE_BYTES`,
    /// `OUTBOUND_QUEUE`, `DEFAULT_CHANNELS` (comma separated)
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./enclave.db"),
            send_rate: 5.0,
            send_burst: 20.0,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = PathBuf::from(path);
            }
        }

        parse_into(&lookup, "SEND_RATE", &mut config.send_rate);
        parse_into(&lookup, "SEND_BURST", &mut config.send_burst);
        parse_into(&lookup, "HISTORY_LIMIT", &mut config.engine.history_limit);
        parse_into(&lookup, "MAX_HISTORY_LIMIT", &mut config.engine.max_history_limit);
        parse_into(&lookup, "MAX_MESSAGE_BYTES", &mut config.engine.max_message_bytes);
        parse_into(&lookup, "OUTBOUND_QUEUE", &mut config.engine.outbound_queue);

        if let Some(list) = lookup("DEFAULT_CHANNELS") {
            config.engine.default_channels = list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }

        if config.engine.history_limit > config.engine.max_history_limit {
            tracing::warn!(
                history_limit = config.engine.history_limit,
                max_history_limit = config.engine.max_history_limit,
                "HISTORY_LIMIT above MAX_HISTORY_LIMIT, clamping"
            );
            config.engine.history_limit = config.engine.max_history_limit;
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

/// Overwrite `slot` with the parsed variable; an unparsable or non-positive
/// value is logged and ignored.
fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => *slot = value,
        _ => tracing::warn!(key, value = %raw, "Invalid setting, using default"),
    }
}
