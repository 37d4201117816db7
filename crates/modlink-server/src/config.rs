//! Server configuration.

use modlink_core::TlsOptions;
use modlink_core::settings::{self, EnvOverrides, read_env_string, read_env_u64, read_env_usize};
use serde::{Deserialize, Serialize};

/// Configuration for an RPC server endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Explicit server id. Defaults to the address DSN.
    pub id: Option<String>,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// How long `close()` waits for tasks and connections, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Certificate and key served on `wss:` addresses.
    pub tls: TlsOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: None,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            shutdown_timeout_ms: 5_000,
            tls: TlsOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Load the `server` section of the settings file.
    pub fn load() -> settings::Result<Self> {
        settings::load_section("server")
    }

    /// Shutdown timeout as a duration.
    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl EnvOverrides for ServerConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(id) = read_env_string("MODLINK_SERVER_ID") {
            self.id = Some(id);
        }
        if let Some(size) = read_env_usize("MODLINK_MAX_MESSAGE_SIZE", 1024, 1024 * 1024 * 1024) {
            self.max_message_size = size;
        }
        if let Some(ms) = read_env_u64("MODLINK_SHUTDOWN_TIMEOUT_MS", 1, 600_000) {
            self.shutdown_timeout_ms = ms;
        }
        if let Some(cert) = read_env_string("MODLINK_TLS_CERT") {
            self.tls.cert = Some(cert.into());
        }
        if let Some(key) = read_env_string("MODLINK_TLS_KEY") {
            self.tls.key = Some(key.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_id_is_unset() {
        let cfg = ServerConfig::default();
        assert!(cfg.id.is_none());
    }

    #[test]
    fn default_max_message_size() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn default_shutdown_timeout() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.shutdown_timeout(), std::time::Duration::from_secs(5));
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig {
            id: Some("node-a".into()),
            ..ServerConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn tls_section_from_json() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{"tls": {"cert": "/etc/modlink/cert.pem", "key": "/etc/modlink/key.pem"}}"#)
                .unwrap();
        assert_eq!(cfg.tls.cert.as_deref(), Some(std::path::Path::new("/etc/modlink/cert.pem")));
        assert!(cfg.tls.reject_unauthorized);
        assert!(cfg.id.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"shutdownTimeoutMs": 250}"#).unwrap();
        assert_eq!(cfg.shutdown_timeout_ms, 250);
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
    }
}
