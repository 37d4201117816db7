//! Connection addresses.
//!
//! An [`Address`] names one end of a channel: a TCP WebSocket URL, a TLS
//! WebSocket URL or a unix-domain socket path, plus the handshake parameters
//! (`id`, `secret`, `codec`). Its [`Address::dsn`] is the canonical string
//! used as server id and routing key.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::Codec;
use crate::errors::{ChannelError, Result};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 80;
const UNIX_BASE: &str = "ws+unix://localhost:80";

/// Transport protocol of an address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Plain WebSocket over TCP.
    #[default]
    #[serde(rename = "ws:")]
    Ws,
    /// WebSocket over TLS.
    #[serde(rename = "wss:")]
    Wss,
    /// WebSocket over a unix-domain socket.
    #[serde(rename = "ws+unix:")]
    WsUnix,
}

impl Protocol {
    /// Scheme with trailing colon, as used in the dsn.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws:",
            Self::Wss => "wss:",
            Self::WsUnix => "ws+unix:",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            "ws+unix" => Some(Self::WsUnix),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit address options, typically read from a settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddressOptions {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Host name, ignored for unix sockets.
    pub host: Option<String>,
    /// TCP port, ignored for unix sockets.
    pub port: Option<u16>,
    /// URL path, or the socket path for unix sockets.
    pub path: Option<String>,
    /// Shared secret.
    pub secret: Option<String>,
    /// Peer id.
    pub id: Option<String>,
    /// Codec selector.
    pub codec: Option<Codec>,
}

/// Parsed connection address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    protocol: Protocol,
    host: String,
    port: u16,
    path: String,
    secret: Option<String>,
    id: Option<String>,
    codec: Codec,
}

impl Address {
    /// Parse a URL, a bare socket path or a Windows absolute path.
    ///
    /// Bare paths are unix sockets; relative ones resolve against the current
    /// directory.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ChannelError::InvalidAddress("empty address".into()));
        }
        let bare_relative = !input.starts_with('/') && !is_windows_absolute(input) && Url::parse(input).is_err();
        let normalized = if is_windows_absolute(input) {
            format!("ws+unix:{input}")
        } else {
            input.to_owned()
        };

        let base = Url::parse(UNIX_BASE).map_err(|e| ChannelError::InvalidAddress(e.to_string()))?;
        let url = base
            .join(&normalized)
            .map_err(|e| ChannelError::InvalidAddress(format!("{input}: {e}")))?;

        let protocol = Protocol::from_scheme(url.scheme()).ok_or_else(|| {
            ChannelError::InvalidAddress(format!("unsupported protocol {}:", url.scheme()))
        })?;

        let mut secret = None;
        let mut id = None;
        let mut codec = Codec::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "secret" if !value.is_empty() => secret = Some(value.into_owned()),
                "id" if !value.is_empty() => id = Some(value.into_owned()),
                "codec" => codec = Codec::parse(&value).unwrap_or_default(),
                _ => {}
            }
        }

        let options = AddressOptions {
            protocol,
            host: url.host_str().map(str::to_owned),
            port: url.port_or_known_default(),
            path: Some(if bare_relative && protocol == Protocol::WsUnix {
                url.path().strip_prefix('/').unwrap_or(url.path()).to_owned()
            } else {
                url.path().to_owned()
            }),
            secret,
            id,
            codec: Some(codec),
        };
        Self::from_options(options)
    }

    /// TCP address from a port and optional host.
    pub fn from_port(port: u16, host: Option<&str>) -> Self {
        Self {
            protocol: Protocol::Ws,
            host: host.unwrap_or(DEFAULT_HOST).to_owned(),
            port,
            path: "/".into(),
            secret: None,
            id: None,
            codec: Codec::default(),
        }
    }

    /// Build from explicit options.
    pub fn from_options(options: AddressOptions) -> Result<Self> {
        let protocol = options.protocol;
        let path = match protocol {
            Protocol::WsUnix => unix_socket_path(options.path.as_deref().unwrap_or_default())?,
            Protocol::Ws | Protocol::Wss => match options.path {
                Some(p) if p.starts_with('/') => p,
                Some(p) if !p.is_empty() => format!("/{p}"),
                _ => "/".into(),
            },
        };
        Ok(Self {
            protocol,
            host: options
                .host
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| DEFAULT_HOST.into()),
            port: options.port.unwrap_or(DEFAULT_PORT),
            path,
            secret: options.secret,
            id: options.id,
            codec: options.codec.unwrap_or_default(),
        })
    }

    /// Canonical name: `ws+unix:<path>` or `<protocol>//<host>:<port><path>`.
    pub fn dsn(&self) -> String {
        match self.protocol {
            Protocol::WsUnix => format!("ws+unix:{}", self.path),
            _ => format!("{}//{}:{}{}", self.protocol, self.host, self.port, self.path),
        }
    }

    /// Transport protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether this is a unix-domain socket address.
    pub fn is_unix(&self) -> bool {
        self.protocol == Protocol::WsUnix
    }

    /// Host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// URL path, or the absolute socket path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Socket file path for unix addresses.
    pub fn socket_path(&self) -> Option<&Path> {
        self.is_unix().then(|| Path::new(&self.path))
    }

    /// Shared secret.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Peer id.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Codec selector.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Same address on another port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Same address with a peer id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Same address with a shared secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Same address with another codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }
}

impl FromStr for Address {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dsn())
    }
}

fn is_windows_absolute(input: &str) -> bool {
    let bytes = input.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && matches!(bytes[2], b'\\' | b'/')
}

fn unix_socket_path(raw: &str) -> Result<String> {
    if !cfg!(unix) {
        return Err(ChannelError::InvalidAddress(
            "unix domain sockets are not supported on this platform".into(),
        ));
    }
    if raw.is_empty() || raw == "/" {
        return Err(ChannelError::InvalidAddress("IPC requires a pathname".into()));
    }
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(raw.to_owned());
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path).to_string_lossy().into_owned())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_url_with_query() {
        let addr = Address::parse("ws://localhost:18888/rpc?id=abc&secret=s3&codec=CLONE").unwrap();
        assert_eq!(addr.protocol(), Protocol::Ws);
        assert_eq!(addr.host(), "localhost");
        assert_eq!(addr.port(), 18888);
        assert_eq!(addr.path(), "/rpc");
        assert_eq!(addr.id(), Some("abc"));
        assert_eq!(addr.secret(), Some("s3"));
        assert_eq!(addr.codec(), Codec::Clone);
        assert_eq!(addr.dsn(), "ws://localhost:18888/rpc");
    }

    #[test]
    fn scheme_default_ports() {
        assert_eq!(Address::parse("ws://example.com").unwrap().port(), 80);
        let tls = Address::parse("wss://example.com/").unwrap();
        assert_eq!(tls.port(), 443);
        assert_eq!(tls.dsn(), "wss://example.com:443/");
    }

    #[test]
    fn bare_absolute_path_is_unix() {
        let addr = Address::parse("/tmp/modlink/test.sock").unwrap();
        assert!(addr.is_unix());
        assert_eq!(addr.path(), "/tmp/modlink/test.sock");
        assert_eq!(addr.dsn(), "ws+unix:/tmp/modlink/test.sock");
        assert_eq!(addr.socket_path(), Some(Path::new("/tmp/modlink/test.sock")));
    }

    #[test]
    fn unix_url_keeps_query_parameters() {
        let addr = Address::parse("ws+unix:/var/run/app.sock?id=worker-1").unwrap();
        assert_eq!(addr.path(), "/var/run/app.sock");
        assert_eq!(addr.id(), Some("worker-1"));
    }

    #[test]
    fn unix_without_path_is_rejected() {
        let err = Address::parse("ws+unix:").unwrap_err();
        assert_eq!(err.to_string(), "IPC requires a pathname");
    }

    #[test]
    fn relative_unix_path_resolves_against_cwd() {
        let addr = Address::from_options(AddressOptions {
            protocol: Protocol::WsUnix,
            path: Some("sockets/app.sock".into()),
            ..AddressOptions::default()
        })
        .unwrap();
        let expected = std::env::current_dir().unwrap().join("sockets/app.sock");
        assert_eq!(Path::new(addr.path()), expected);
    }

    #[test]
    fn relative_bare_path_resolves_against_cwd() {
        let cwd = std::env::current_dir().unwrap();
        let addr = Address::parse("sockets/app.sock").unwrap();
        assert!(addr.is_unix());
        assert_eq!(Path::new(addr.path()), cwd.join("sockets/app.sock"));
        assert_eq!(addr.dsn(), format!("ws+unix:{}", cwd.join("sockets/app.sock").display()));

        let addr = Address::parse("ws+unix:sockets/app.sock?id=w1").unwrap();
        assert_eq!(Path::new(addr.path()), cwd.join("sockets/app.sock"));
        assert_eq!(addr.id(), Some("w1"));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(matches!(
            Address::parse("http://localhost:80/"),
            Err(ChannelError::InvalidAddress(_))
        ));
    }

    #[test]
    fn port_constructor_uses_defaults() {
        let addr = Address::from_port(18888, None);
        assert_eq!(addr.dsn(), "ws://127.0.0.1:18888/");
        assert_eq!(addr.codec(), Codec::Json);
        let addr = Address::from_port(9000, Some("0.0.0.0")).with_port(9001);
        assert_eq!(addr.dsn(), "ws://0.0.0.0:9001/");
    }

    #[test]
    fn windows_path_detection() {
        assert!(is_windows_absolute(r"C:\pipes\app.sock"));
        assert!(is_windows_absolute("d:/x"));
        assert!(!is_windows_absolute("/tmp/x"));
        assert!(!is_windows_absolute("ws://h"));
    }

    #[test]
    fn options_deserialize_from_settings_json() {
        let opts: AddressOptions =
            serde_json::from_str(r#"{"protocol":"ws:","host":"10.0.0.2","port":7000,"codec":"BINARY-CLONE"}"#)
                .unwrap();
        let addr = Address::from_options(opts).unwrap();
        assert_eq!(addr.dsn(), "ws://10.0.0.2:7000/");
        assert_eq!(addr.codec(), Codec::Clone);
    }
}
