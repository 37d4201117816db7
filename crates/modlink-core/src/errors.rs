//! Channel error types.

use std::panic::Location;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Error code constants ────────────────────────────────────────────

/// Upgrade handshake failed or was rejected.
pub const HANDSHAKE_FAILED: &str = "HANDSHAKE_FAILED";
/// The remote module raised an error.
pub const REMOTE_ERROR: &str = "REMOTE_ERROR";
/// No ready provider for the module.
pub const NOT_AVAILABLE: &str = "NOT_AVAILABLE";
/// A call exceeded its deadline.
pub const TIMEOUT: &str = "TIMEOUT";
/// The socket failed or closed under a call.
pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";
/// A peer sent a frame that breaks the protocol.
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
/// The method does not exist on the module.
pub const NOT_A_FUNCTION: &str = "NOT_A_FUNCTION";
/// Connection address could not be parsed.
pub const INVALID_ADDRESS: &str = "INVALID_ADDRESS";
/// Operation not valid in the current endpoint state.
pub const INVALID_STATE: &str = "INVALID_STATE";
/// A frame could not be encoded or decoded.
pub const CODEC_ERROR: &str = "CODEC_ERROR";
/// Local I/O failure.
pub const IO_ERROR: &str = "IO_ERROR";
/// TLS material could not be loaded or used.
pub const TLS_ERROR: &str = "TLS_ERROR";

/// Error object carried in `THROW` frames.
///
/// Travels as `{name, message, stack}` and is rebuilt on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    /// Error class name (`Error`, `TypeError`, `ReferenceError`, ...).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stack or call-site trail, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    /// Error with an explicit class name.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Plain `Error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// `ReferenceError`.
    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::new("ReferenceError", message)
    }

    /// Wire representation.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        let _ = obj.insert("name".into(), Value::String(self.name.clone()));
        let _ = obj.insert("message".into(), Value::String(self.message.clone()));
        if let Some(stack) = &self.stack {
            let _ = obj.insert("stack".into(), Value::String(stack.clone()));
        }
        Value::Object(obj)
    }

    /// Rebuild from a wire payload. Strings become the message of a plain
    /// `Error`; anything else is rendered into the message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(obj) => {
                let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_owned);
                Self {
                    name: text("name").unwrap_or_else(|| "Error".into()),
                    message: text("message").unwrap_or_default(),
                    stack: text("stack"),
                }
            }
            Value::String(message) => Self::error(message),
            Value::Null => Self::error(""),
            other => Self::error(other.to_string()),
        }
    }

    /// Append the caller's source location to the stack.
    #[must_use]
    pub fn with_call_site(mut self, site: &Location<'_>) -> Self {
        let base = self
            .stack
            .take()
            .unwrap_or_else(|| format!("{}: {}", self.name, self.message));
        self.stack = Some(format!(
            "{base}\n    at {}:{}:{}",
            site.file(),
            site.line(),
            site.column()
        ));
        self
    }
}

/// Errors raised by channel endpoints and call handles.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// Upgrade rejected or greeting missing.
    #[error("{message}")]
    Handshake {
        /// HTTP status of the rejection, if the server answered one.
        status: Option<u16>,
        /// Description.
        message: String,
    },

    /// Error raised by the target module.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// No ready provider (or the module is not ready).
    #[error("{module} is not available")]
    Unavailable {
        /// Module name.
        module: String,
    },

    /// Deadline elapsed before the answer arrived.
    #[error("{module}.{method}() timeout after {after}")]
    Timeout {
        /// Module name.
        module: String,
        /// Method name.
        method: String,
        /// Humanized deadline, e.g. `1 second`.
        after: String,
    },

    /// Method missing from the module.
    #[error("{module}.{method} is not a function")]
    NotAFunction {
        /// Module name.
        module: String,
        /// Method name.
        method: String,
    },

    /// Socket failure or closure.
    #[error("{0}")]
    Transport(String),

    /// Peer violated the frame protocol.
    #[error("{0}")]
    Protocol(String),

    /// Unparseable or unsupported address.
    #[error("{0}")]
    InvalidAddress(String),

    /// Operation not allowed in the current state.
    #[error("{0}")]
    InvalidState(String),

    /// Encoding or decoding failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Local I/O failure.
    #[error("io error: {0}")]
    Io(String),

    /// Bad or missing TLS certificate material.
    #[error("tls error: {0}")]
    Tls(String),
}

impl ChannelError {
    /// Error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => HANDSHAKE_FAILED,
            Self::Remote(_) => REMOTE_ERROR,
            Self::Unavailable { .. } => NOT_AVAILABLE,
            Self::Timeout { .. } => TIMEOUT,
            Self::Transport(_) => TRANSPORT_ERROR,
            Self::Protocol(_) => PROTOCOL_ERROR,
            Self::NotAFunction { .. } => NOT_A_FUNCTION,
            Self::InvalidAddress(_) => INVALID_ADDRESS,
            Self::InvalidState(_) => INVALID_STATE,
            Self::Codec(_) => CODEC_ERROR,
            Self::Io(_) => IO_ERROR,
            Self::Tls(_) => TLS_ERROR,
        }
    }

    /// Module unavailable.
    pub fn unavailable(module: &str) -> Self {
        Self::Unavailable {
            module: module.to_owned(),
        }
    }

    /// Method missing.
    pub fn not_a_function(module: &str, method: &str) -> Self {
        Self::NotAFunction {
            module: module.to_owned(),
            method: method.to_owned(),
        }
    }

    /// Deadline elapsed.
    pub fn timeout(module: &str, method: &str, after: Duration) -> Self {
        Self::Timeout {
            module: module.to_owned(),
            method: method.to_owned(),
            after: humanize_duration(after),
        }
    }

    /// Payload sent in a `THROW` frame for this error.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Remote(err) => err.clone(),
            Self::Unavailable { .. } => RemoteError::reference_error(self.to_string()),
            Self::NotAFunction { .. } => RemoteError::type_error(self.to_string()),
            other => RemoteError::error(other.to_string()),
        }
    }

    /// Attach the caller's location to remote errors.
    #[must_use]
    pub fn with_call_site(self, site: &Location<'_>) -> Self {
        match self {
            Self::Remote(err) => Self::Remote(err.with_call_site(site)),
            other => other,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Render a duration the way timeout messages spell it:
/// `500 milliseconds`, `1 second`, `2 minutes`.
pub fn humanize_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    let (num, unit) = if ms < 1000 {
        (ms, "millisecond")
    } else if ms < 60_000 {
        ((ms + 500) / 1000, "second")
    } else {
        ((ms + 30_000) / 60_000, "minute")
    };
    if num == 1 {
        format!("{num} {unit}")
    } else {
        format!("{num} {unit}s")
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn humanize_picks_unit_and_plural() {
        assert_eq!(humanize_duration(Duration::from_millis(1)), "1 millisecond");
        assert_eq!(humanize_duration(Duration::from_millis(500)), "500 milliseconds");
        assert_eq!(humanize_duration(Duration::from_millis(1000)), "1 second");
        assert_eq!(humanize_duration(Duration::from_millis(1499)), "1 second");
        assert_eq!(humanize_duration(Duration::from_millis(5000)), "5 seconds");
        assert_eq!(humanize_duration(Duration::from_millis(120_000)), "2 minutes");
    }

    #[test]
    fn timeout_message() {
        let err = ChannelError::timeout("detail", "getOrgs", Duration::from_secs(1));
        assert_eq!(err.to_string(), "detail.getOrgs() timeout after 1 second");
        assert_eq!(err.code(), TIMEOUT);
    }

    #[test]
    fn remote_error_survives_wire_form() {
        let original = RemoteError::type_error("x is not a number");
        let rebuilt = RemoteError::from_value(original.to_value());
        assert_eq!(rebuilt.name, "TypeError");
        assert_eq!(rebuilt.message, "x is not a number");
        assert!(rebuilt.stack.is_none());
    }

    #[test]
    fn string_payload_becomes_plain_error() {
        let err = RemoteError::from_value(json!("boom"));
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "boom");
        assert_eq!(RemoteError::from_value(json!(42)).message, "42");
    }

    #[test]
    fn availability_errors_travel_as_reference_errors() {
        let remote = ChannelError::unavailable("user").to_remote();
        assert_eq!(remote.name, "ReferenceError");
        assert_eq!(remote.message, "user is not available");

        let remote = ChannelError::not_a_function("math", "pow").to_remote();
        assert_eq!(remote.name, "TypeError");
        assert_eq!(remote.message, "math.pow is not a function");
    }

    #[test]
    fn call_site_is_appended_to_stack() {
        let site = Location::caller();
        let err = RemoteError::error("nope").with_call_site(site);
        let stack = err.stack.unwrap();
        assert!(stack.starts_with("Error: nope\n    at "));
        assert!(stack.contains("errors.rs"));
    }

    #[test]
    fn io_errors_convert() {
        let err: ChannelError = std::io::Error::other("disk gone").into();
        assert_eq!(err.code(), IO_ERROR);
        assert!(err.to_string().contains("disk gone"));
    }
}
