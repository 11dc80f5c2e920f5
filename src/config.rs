//! Sync configuration parsed from environment variables.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::time::Duration;

use crate::consts::{ECHO_WINDOW_MS, GESTURE_WINDOW_MS, HEARTBEAT_SECS, RECONNECT_MAX_MS};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Engine and transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// REST/realtime base URL, e.g. `https://project.supabase.co`.
    pub api_url: String,
    /// Project API key, sent with every request.
    pub api_key: String,
    /// Signed-in user's access token. Falls back to the API key.
    pub access_token: Option<String>,
    /// Ordinary echo-suppression window.
    pub echo_window: Duration,
    /// Extended suppression window while a gesture is live.
    pub gesture_window: Duration,
    /// Ceiling for the change-stream reconnect backoff.
    pub reconnect_max: Duration,
    /// Interval between change-stream heartbeats.
    pub heartbeat: Duration,
    /// Per-request timeout for persistence calls.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            access_token: None,
            echo_window: Duration::from_millis(ECHO_WINDOW_MS),
            gesture_window: Duration::from_millis(GESTURE_WINDOW_MS),
            reconnect_max: Duration::from_millis(RECONNECT_MAX_MS),
            heartbeat: Duration::from_secs(HEARTBEAT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl SyncConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `BOARDSYNC_API_URL`
    /// - `BOARDSYNC_API_KEY`
    ///
    /// Optional:
    /// - `BOARDSYNC_ACCESS_TOKEN`
    /// - `BOARDSYNC_ECHO_WINDOW_MS`: default 1000
    /// - `BOARDSYNC_GESTURE_WINDOW_MS`: default 3000
    /// - `BOARDSYNC_RECONNECT_MAX_MS`: default 10000
    /// - `BOARDSYNC_HEARTBEAT_SECS`: default 25
    /// - `BOARDSYNC_REQUEST_TIMEOUT_SECS`: default 15
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| match std::env::var(key) {
            Ok(value) => Some(value),
            Err(_) => None,
        })
    }

    /// Build config from an arbitrary key lookup. `from_env` delegates here.
    ///
    /// # Errors
    ///
    /// Returns `Missing` for an absent or blank required variable and
    /// `Invalid` for a number that doesn't parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };
        let millis = |var: &'static str, default: u64| parse_u64(&lookup, var, default).map(Duration::from_millis);
        let secs = |var: &'static str, default: u64| parse_u64(&lookup, var, default).map(Duration::from_secs);

        Ok(Self {
            api_url: required("BOARDSYNC_API_URL")?.trim_end_matches('/').to_owned(),
            api_key: required("BOARDSYNC_API_KEY")?,
            access_token: lookup("BOARDSYNC_ACCESS_TOKEN").filter(|v| !v.trim().is_empty()),
            echo_window: millis("BOARDSYNC_ECHO_WINDOW_MS", ECHO_WINDOW_MS)?,
            gesture_window: millis("BOARDSYNC_GESTURE_WINDOW_MS", GESTURE_WINDOW_MS)?,
            reconnect_max: millis("BOARDSYNC_RECONNECT_MAX_MS", RECONNECT_MAX_MS)?,
            heartbeat: secs("BOARDSYNC_HEARTBEAT_SECS", HEARTBEAT_SECS)?,
            request_timeout: secs("BOARDSYNC_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
        })
    }

    /// Websocket URL of the realtime endpoint derived from `api_url`.
    #[must_use]
    pub fn realtime_url(&self) -> String {
        let base = if let Some(rest) = self.api_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.api_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.api_url.clone()
        };
        format!("{base}/realtime/v1/websocket?apikey={}&vsn=1.0.0", self.api_key)
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}
