//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use causerie_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_ID_MIN_LENGTH};

use crate::rate_limit::{parse_burst, RateLimitConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8925`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `causerie.db` in the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Base URL of the abuse attestation service. Unset disables the check.
    /// Env: `AAO_SERVER`
    pub aao_server: Option<String>,

    /// Env: `AAO_TIMEOUT_MS`
    /// Default: `5000`
    pub aao_timeout: Duration,

    /// Env: `RATE_LIMIT_*`
    pub rate_limit: RateLimitConfig,

    /// Delay before a blast is pushed to every connected client.
    /// Env: `BLAST_PUSH_DELAY_SECS`
    /// Default: `30`
    pub blast_push_delay: Duration,

    /// Env: `EVENT_POLL_INTERVAL_MS`
    /// Default: `250`
    pub event_poll_interval: Duration,

    /// Change events older than this are pruned.
    /// Env: `EVENT_RETENTION_SECS`
    /// Default: `3600`
    pub event_retention: Duration,

    /// How long pushed payloads are kept for replay to reconnecting clients.
    /// Env: `WS_REPLAY_TTL_SECS`
    /// Default: `10`
    pub ws_replay_ttl: Duration,

    /// Per-connection outbound queue; a client whose queue is full is dropped.
    /// Env: `WS_SEND_QUEUE`
    /// Default: `128`
    pub ws_send_queue: usize,

    /// Env: `ID_MIN_LENGTH`
    /// Default: `5`
    pub id_min_length: u8,

    /// Env: `ID_ALPHABET`
    pub id_alphabet: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            aao_server: None,
            aao_timeout: Duration::from_millis(5000),
            rate_limit: RateLimitConfig::default(),
            blast_push_delay: Duration::from_secs(30),
            event_poll_interval: Duration::from_millis(250),
            event_retention: Duration::from_secs(3600),
            ws_replay_ttl: Duration::from_secs(10),
            ws_send_queue: 128,
            id_min_length: DEFAULT_ID_MIN_LENGTH,
            id_alphabet: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        parse_var("HTTP_ADDR", &mut config.http_addr);

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(url) = std::env::var("AAO_SERVER") {
            let url = url.trim().trim_end_matches('/');
            if !url.is_empty() {
                config.aao_server = Some(url.to_string());
            }
        }

        let mut millis = config.aao_timeout.as_millis() as u64;
        parse_var("AAO_TIMEOUT_MS", &mut millis);
        config.aao_timeout = Duration::from_millis(millis);

        let limits = &mut config.rate_limit;
        parse_var("RATE_LIMIT_TIMEFRAME_HOURS", &mut limits.timeframe_hours);
        parse_var("RATE_LIMIT_MAX_MESSAGES", &mut limits.max_messages);
        parse_var(
            "RATE_LIMIT_MAX_MESSAGES_PER_RECIPIENT",
            &mut limits.max_messages_per_recipient,
        );
        parse_var("RATE_LIMIT_MAX_NEW_CHATS", &mut limits.max_new_chats);
        if let Ok(value) = std::env::var("RATE_LIMIT_BURST") {
            match parse_burst(&value) {
                Ok(windows) => limits.burst = windows,
                Err(e) => tracing::warn!(value = %value, error = %e, "Invalid RATE_LIMIT_BURST, using default"),
            }
        }

        let mut secs = config.blast_push_delay.as_secs();
        parse_var("BLAST_PUSH_DELAY_SECS", &mut secs);
        config.blast_push_delay = Duration::from_secs(secs);

        let mut millis = config.event_poll_interval.as_millis() as u64;
        parse_var("EVENT_POLL_INTERVAL_MS", &mut millis);
        config.event_poll_interval = Duration::from_millis(millis.max(1));

        let mut secs = config.event_retention.as_secs();
        parse_var("EVENT_RETENTION_SECS", &mut secs);
        config.event_retention = Duration::from_secs(secs);

        let mut secs = config.ws_replay_ttl.as_secs();
        parse_var("WS_REPLAY_TTL_SECS", &mut secs);
        config.ws_replay_ttl = Duration::from_secs(secs);

        parse_var("WS_SEND_QUEUE", &mut config.ws_send_queue);
        config.ws_send_queue = config.ws_send_queue.max(1);

        parse_var("ID_MIN_LENGTH", &mut config.id_min_length);
        if let Ok(alphabet) = std::env::var("ID_ALPHABET") {
            if !alphabet.is_empty() {
                config.id_alphabet = Some(alphabet);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Overwrite `target` with the parsed value of `name`, if set and valid.
fn parse_var<T: FromStr>(name: &str, target: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(var = name, value = %raw, "Invalid value, using default"),
    }
}
