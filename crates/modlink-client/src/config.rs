//! Client configuration.

use std::time::Duration;

use modlink_core::TlsOptions;
use modlink_core::settings::{self, EnvOverrides, read_env_string, read_env_u64};
use serde::{Deserialize, Serialize};

/// Configuration for an RPC client endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Client id sent in the handshake. An `id` address parameter wins.
    pub id: String,
    /// Per-call deadline, also used as the connect timeout.
    pub timeout_ms: u64,
    /// Interval between keepalive pings.
    pub ping_interval_ms: u64,
    /// How long to wait for a pong before dropping the socket.
    pub ping_timeout_ms: u64,
    /// Pause between reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// Trust roots and client identity for `wss:` servers.
    pub tls: TlsOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::now_v7().simple().to_string(),
            timeout_ms: 5_000,
            ping_interval_ms: 5_000,
            ping_timeout_ms: 5_000,
            reconnect_delay_ms: 2_000,
            tls: TlsOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Load the `client` section of the settings file.
    pub fn load() -> settings::Result<Self> {
        settings::load_section("client")
    }

    /// Per-call deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Keepalive interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Pong deadline.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Reconnect backoff.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl EnvOverrides for ClientConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(id) = read_env_string("MODLINK_CLIENT_ID") {
            self.id = id;
        }
        if let Some(ms) = read_env_u64("MODLINK_TIMEOUT_MS", 1, 3_600_000) {
            self.timeout_ms = ms;
        }
        if let Some(ms) = read_env_u64("MODLINK_PING_INTERVAL_MS", 1, 3_600_000) {
            self.ping_interval_ms = ms;
        }
        if let Some(ms) = read_env_u64("MODLINK_PING_TIMEOUT_MS", 1, 3_600_000) {
            self.ping_timeout_ms = ms;
        }
        if let Some(ms) = read_env_u64("MODLINK_RECONNECT_DELAY_MS", 1, 3_600_000) {
            self.reconnect_delay_ms = ms;
        }
        if let Some(ca) = read_env_string("MODLINK_TLS_CA") {
            self.tls.ca = Some(ca.into());
        }
    }
}
