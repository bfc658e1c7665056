//! Relay configuration loaded from environment variables.
//!
//! All settings come from `NOSTR_RELAY_`-prefixed environment variables (or
//! a `.env` file via `dotenvy`). Missing or unparsable values fall back to
//! defaults, except for the listen address and the store backend, which
//! are startup errors when malformed.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

/// Prefix shared by every configuration key.
pub const ENV_PREFIX: &str = "NOSTR_RELAY_";

/// Which [`crate::store::EventStore`] implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// PostgreSQL with `LISTEN`/`NOTIFY`.
    Postgres,
    /// In-process map; nothing survives a restart.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level relay configuration.
///
/// Loaded once at startup via [`RelayConfig::from_env`].
#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    /// Socket address to bind (e.g. `0.0.0.0:8080`).
    pub listen_addr: SocketAddr,

    /// Event store implementation.
    pub store: StoreBackend,

    /// PostgreSQL connection string.
    #[serde(skip)]
    pub database_url: String,

    /// Maximum number of database connections in the pool.
    pub database_max_connections: u32,

    /// Minimum idle connections in the pool.
    pub database_min_connections: u32,

    /// Timeout in seconds for acquiring a database connection.
    pub database_connect_timeout_secs: u64,

    /// Capacity of each subscription's delivery channel.
    pub subscription_capacity: usize,

    /// Capacity of each connection's outbound frame queue.
    pub outbound_capacity: usize,

    /// Upper bound applied to client `limit` values.
    pub max_limit: u64,

    /// Consecutive change-feed failures before live delivery is reported as
    /// degraded.
    pub listener_max_retries: u32,

    /// Initial change-feed retry delay in milliseconds.
    pub listener_backoff_ms: u64,

    /// Seconds to wait for sessions to finish during shutdown.
    pub shutdown_grace_secs: u64,

    /// Log output format.
    pub log_format: LogFormat,

    /// Relay name for the information document.
    pub relay_name: String,

    /// Relay description for the information document.
    pub relay_description: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store: StoreBackend::Postgres,
            database_url: "postgres://localhost:5432/nostr_relay?sslmode=disable".to_string(),
            database_max_connections: 10,
            database_min_connections: 2,
            database_connect_timeout_secs: 5,
            subscription_capacity: 100,
            outbound_capacity: 256,
            max_limit: 5000,
            listener_max_retries: 10,
            listener_backoff_ms: 250,
            shutdown_grace_secs: 10,
            log_format: LogFormat::Text,
            relay_name: "nostr-relay".to_string(),
            relay_description: "NOSTR relay backed by PostgreSQL".to_string(),
        }
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `NOSTR_RELAY_LISTEN_ADDR` is not a valid
    /// [`SocketAddr`] or `NOSTR_RELAY_STORE` names an unknown backend.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Keys are passed
    /// with the [`ENV_PREFIX`] applied.
    ///
    /// # Errors
    ///
    /// See [`RelayConfig::from_env`].
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let defaults = Self::default();

        let listen_addr = match get("LISTEN_ADDR") {
            Some(addr) => addr.parse()?,
            None => defaults.listen_addr,
        };
        let store = match get("STORE") {
            Some(backend) => backend.parse()?,
            None => defaults.store,
        };
        let log_format = match get("LOG_FORMAT").as_deref() {
            Some("json") | Some("JSON") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            listen_addr,
            store,
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            database_max_connections: parse_or(
                get("DATABASE_MAX_CONNECTIONS"),
                defaults.database_max_connections,
            ),
            database_min_connections: parse_or(
                get("DATABASE_MIN_CONNECTIONS"),
                defaults.database_min_connections,
            ),
            database_connect_timeout_secs: parse_or(
                get("DATABASE_CONNECT_TIMEOUT_SECS"),
                defaults.database_connect_timeout_secs,
            ),
            subscription_capacity: parse_or(
                get("SUBSCRIPTION_CAPACITY"),
                defaults.subscription_capacity,
            ),
            outbound_capacity: parse_or(get("OUTBOUND_CAPACITY"), defaults.outbound_capacity),
            max_limit: parse_or(get("MAX_LIMIT"), defaults.max_limit),
            listener_max_retries: parse_or(
                get("LISTENER_MAX_RETRIES"),
                defaults.listener_max_retries,
            ),
            listener_backoff_ms: parse_or(get("LISTENER_BACKOFF_MS"), defaults.listener_backoff_ms),
            shutdown_grace_secs: parse_or(get("SHUTDOWN_GRACE_SECS"), defaults.shutdown_grace_secs),
            log_format,
            relay_name: get("NAME").unwrap_or(defaults.relay_name),
            relay_description: get("DESCRIPTION").unwrap_or(defaults.relay_description),
        })
    }

    /// Grace period granted to sessions during shutdown.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Returns the database URL with any password replaced by `***`, for
    /// logging.
    #[must_use]
    pub fn redacted_database_url(&self) -> String {
        redact_password(&self.database_url)
    }
}

/// Parses `value` as `T`, returning `default` on missing or invalid input.
fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn redact_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}
