//! Frame encoding.
//!
//! `JSON` frames travel as WebSocket text messages. `CLONE` frames travel as
//! binary MessagePack messages and keep the value structure intact, including
//! nested error objects. A binary message on a `JSON` channel is read as UTF-8
//! JSON.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{ChannelError, Result};

/// Codec negotiated during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    /// JSON text frames.
    #[default]
    #[serde(rename = "JSON")]
    Json,
    /// MessagePack binary frames.
    #[serde(rename = "CLONE", alias = "BINARY-CLONE")]
    Clone,
}

/// Raw WebSocket message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
}

impl Codec {
    /// Wire name sent in the `codec` query parameter and the CONNECT frame.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "JSON",
            Self::Clone => "CLONE",
        }
    }

    /// Resolve a wire name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "JSON" => Some(Self::Json),
            "CLONE" | "BINARY-CLONE" => Some(Self::Clone),
            _ => None,
        }
    }

    /// Encode a frame.
    pub fn encode<T: Serialize>(self, frame: &T) -> Result<Payload> {
        match self {
            Self::Json => serde_json::to_string(frame)
                .map(Payload::Text)
                .map_err(|e| ChannelError::Codec(e.to_string())),
            Self::Clone => rmp_serde::to_vec(frame)
                .map(Payload::Binary)
                .map_err(|e| ChannelError::Codec(e.to_string())),
        }
    }

    /// Decode a frame.
    pub fn decode<T: DeserializeOwned>(self, payload: &Payload) -> Result<T> {
        match (self, payload) {
            (_, Payload::Text(text)) => {
                serde_json::from_str(text).map_err(|e| ChannelError::Codec(e.to_string()))
            }
            (Self::Clone, Payload::Binary(bytes)) => {
                rmp_serde::from_slice(bytes).map_err(|e| ChannelError::Codec(e.to_string()))
            }
            (Self::Json, Payload::Binary(bytes)) => {
                serde_json::from_slice(bytes).map_err(|e| ChannelError::Codec(e.to_string()))
            }
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| ChannelError::Codec(format!("unknown codec {s:?}")))
    }
}
