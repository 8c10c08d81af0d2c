//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a local console can start with zero
//! configuration.

use std::time::Duration;

use souk_net::ReconnectPolicy;
use souk_shared::constants::{
    DEFAULT_NOTIFICATION_LOG_CAP, DEFAULT_NOTIFICATION_SOUND, DEFAULT_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY_MAX_MS, DEFAULT_RECONNECT_DELAY_MS, RECONNECT_JITTER,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the realtime hub.
    /// Env: `SOUK_SOCKET_URL`
    /// Default: `ws://localhost:8800/ws`
    pub socket_url: String,

    /// Base URL of the REST backend (chat history and persistence).
    /// Env: `SOUK_API_URL`
    /// Default: `http://localhost:8800`
    pub api_url: String,

    /// Reconnection attempts before giving up.
    /// Env: `SOUK_RECONNECT_ATTEMPTS`
    /// Default: `5`
    pub reconnect_attempts: u32,

    /// First reconnection delay.
    /// Env: `SOUK_RECONNECT_DELAY_MS`
    /// Default: 1 s
    pub reconnect_delay: Duration,

    /// Reconnection delay ceiling.
    /// Env: `SOUK_RECONNECT_DELAY_MAX_MS`
    /// Default: 5 s
    pub reconnect_delay_max: Duration,

    /// Newest notifications kept in the in-app log.
    /// Env: `SOUK_NOTIFICATION_LOG_CAP`
    /// Default: `200`
    pub notification_log_cap: usize,

    /// Audio cue for new notifications.
    /// Env: `SOUK_SOUND_PATH`
    /// Default: `/sounds/notification.wav`
    pub sound_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://localhost:8800/ws".to_string(),
            api_url: "http://localhost:8800".to_string(),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            reconnect_delay_max: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MAX_MS),
            notification_log_cap: DEFAULT_NOTIFICATION_LOG_CAP,
            sound_path: DEFAULT_NOTIFICATION_SOUND.to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("SOUK_SOCKET_URL") {
            config.socket_url = url;
        }

        if let Some(url) = lookup("SOUK_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }

        if let Some(val) = lookup("SOUK_RECONNECT_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) => config.reconnect_attempts = n,
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid SOUK_RECONNECT_ATTEMPTS, using default"
                ),
            }
        }

        if let Some(val) = lookup("SOUK_RECONNECT_DELAY_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.reconnect_delay = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid SOUK_RECONNECT_DELAY_MS, using default"
                ),
            }
        }

        if let Some(val) = lookup("SOUK_RECONNECT_DELAY_MAX_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.reconnect_delay_max = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid SOUK_RECONNECT_DELAY_MAX_MS, using default"
                ),
            }
        }

        if let Some(val) = lookup("SOUK_NOTIFICATION_LOG_CAP") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.notification_log_cap = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid SOUK_NOTIFICATION_LOG_CAP, using default"
                ),
            }
        }

        if let Some(path) = lookup("SOUK_SOUND_PATH") {
            if !path.is_empty() {
                config.sound_path = path;
            }
        }

        if config.reconnect_delay_max < config.reconnect_delay {
            tracing::warn!("Reconnect delay ceiling below base delay, raising it");
            config.reconnect_delay_max = config.reconnect_delay;
        }

        config
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            base_delay: self.reconnect_delay,
            max_delay: self.reconnect_delay_max,
            jitter: RECONNECT_JITTER,
        }
    }
}
