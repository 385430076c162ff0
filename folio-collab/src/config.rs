//! Relay configuration loaded from the environment.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Bind host (default: 0.0.0.0)
    pub host: String,
    /// Bind port (default: 4444; 0 picks a free port)
    pub port: u16,
    /// Accepted `Origin` values; `*` admits any origin
    pub allowed_origins: Vec<String>,
    /// Rate-limit window (default: 60 s)
    pub rate_limit_window: Duration,
    /// Connection attempts allowed per IP per window (default: 100)
    pub rate_limit_max: u32,
    /// Shared secret required from clients when set
    pub api_key: Option<String>,
    /// Frames buffered per peer before a slow peer starts dropping
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4444,
            allowed_origins: vec!["http://localhost:5173".to_string()],
            rate_limit_window: Duration::from_millis(60_000),
            rate_limit_max: 100,
            api_key: None,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Read `HOST`, `PORT`, `ALLOWED_ORIGINS`, `RATE_LIMIT_WINDOW_MS`,
    /// `RATE_LIMIT_MAX` and `SIGNALING_API_KEY`. Unset variables keep their
    /// defaults; set but malformed numbers are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = get("HOST").unwrap_or(defaults.host);
        let port = match get("PORT") {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidPort(v))?,
            None => defaults.port,
        };

        let allowed_origins = match get("ALLOWED_ORIGINS") {
            Some(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.allowed_origins,
        };

        let rate_limit_window = match get("RATE_LIMIT_WINDOW_MS") {
            Some(v) => Duration::from_millis(v.parse().map_err(|_| ConfigError::InvalidNumber {
                key: "RATE_LIMIT_WINDOW_MS",
                value: v.clone(),
            })?),
            None => defaults.rate_limit_window,
        };
        if rate_limit_window.is_zero() {
            return Err(ConfigError::InvalidNumber {
                key: "RATE_LIMIT_WINDOW_MS",
                value: "0".to_string(),
            });
        }

        let rate_limit_max = match get("RATE_LIMIT_MAX") {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidNumber {
                key: "RATE_LIMIT_MAX",
                value: v.clone(),
            })?,
            None => defaults.rate_limit_max,
        };

        Ok(Self {
            host,
            port,
            allowed_origins,
            rate_limit_window,
            rate_limit_max,
            api_key: get("SIGNALING_API_KEY"),
            broadcast_capacity: defaults.broadcast_capacity,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("PORT must be a valid port number, got {0:?}")]
    InvalidPort(String),
    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
}
