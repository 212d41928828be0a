//! Relay connection configuration.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SEND_GRACE_MS: u64 = 1_000;
pub const DEFAULT_LIST_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_GET_TIMEOUT_MS: u64 = 3_000;

pub const ENV_CONNECT_TIMEOUT_MS: &str = "NOSTR_CLIENT_CONNECT_TIMEOUT_MS";
pub const ENV_SEND_GRACE_MS: &str = "NOSTR_CLIENT_SEND_GRACE_MS";
pub const ENV_LIST_TIMEOUT_MS: &str = "NOSTR_CLIENT_LIST_TIMEOUT_MS";
pub const ENV_GET_TIMEOUT_MS: &str = "NOSTR_CLIENT_GET_TIMEOUT_MS";

/// Relay connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound on the WebSocket handshake.
    pub connect_timeout_ms: u64,
    /// How long an outbound frame waits for the connection to open before it
    /// is dropped.
    pub send_grace_ms: u64,
    pub list_timeout_ms: u64,
    pub get_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            send_grace_ms: DEFAULT_SEND_GRACE_MS,
            list_timeout_ms: DEFAULT_LIST_TIMEOUT_MS,
            get_timeout_ms: DEFAULT_GET_TIMEOUT_MS,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by any `NOSTR_CLIENT_*_MS` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let fields: [(&str, &mut u64); 4] = [
            (ENV_CONNECT_TIMEOUT_MS, &mut config.connect_timeout_ms),
            (ENV_SEND_GRACE_MS, &mut config.send_grace_ms),
            (ENV_LIST_TIMEOUT_MS, &mut config.list_timeout_ms),
            (ENV_GET_TIMEOUT_MS, &mut config.get_timeout_ms),
        ];
        for (name, slot) in fields {
            let Some(raw) = lookup(name) else {
                continue;
            };
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            *slot = trimmed.parse::<u64>().map_err(|error| {
                ClientError::InvalidConfig(format!("{name}={trimmed}: {error}"))
            })?;
        }
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_grace(&self) -> Duration {
        Duration::from_millis(self.send_grace_ms)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_send_grace(mut self, grace: Duration) -> Self {
        self.send_grace_ms = duration_ms(grace);
        self
    }

    pub fn with_list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout_ms = duration_ms(timeout);
        self
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
