//! WebSocket upgrade handshake.
//!
//! Every request lands here. A non-upgrade request is answered 406, an
//! upgrade on the wrong path 404 (TCP only), an upgrade without an `id` or
//! with a wrong `secret` 401. Accepted upgrades start a peer session with
//! the requested codec, or the server's default one.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use modlink_core::Codec;
use serde::Deserialize;
use tracing::debug;

use crate::server::ServerShared;
use crate::session::run_peer_session;

/// Query parameters of the upgrade request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HandshakeQuery {
    /// Peer id.
    pub id: Option<String>,
    /// Shared secret.
    pub secret: Option<String>,
    /// Requested codec.
    pub codec: Option<String>,
}

/// Check the peer id and secret. Returns the peer id.
pub fn authorize(query: &HandshakeQuery, secret: Option<&str>) -> Result<String, StatusCode> {
    let id = query
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if let Some(expected) = secret {
        if query.secret.as_deref() != Some(expected) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(id.to_owned())
}

/// Codec for the connection: the requested one if known, else `fallback`.
pub fn negotiate_codec(query: &HandshakeQuery, fallback: Codec) -> Codec {
    query.codec.as_deref().and_then(Codec::parse).unwrap_or(fallback)
}

/// Axum handler for every route of the server.
pub async fn upgrade_handler(
    State(shared): State<Arc<ServerShared>>,
    uri: Uri,
    Query(query): Query<HandshakeQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(upgrade) = upgrade else {
        return reject(StatusCode::NOT_ACCEPTABLE);
    };

    let address = shared.address();
    if !address.is_unix() && uri.path() != address.path() {
        debug!(path = uri.path(), "upgrade on unknown path");
        return reject(StatusCode::NOT_FOUND);
    }

    let peer_id = match authorize(&query, address.secret()) {
        Ok(peer_id) => peer_id,
        Err(status) => {
            debug!(peer_id = ?query.id, "upgrade not authorized");
            return reject(status);
        }
    };

    let codec = negotiate_codec(&query, address.codec());
    upgrade
        .max_message_size(shared.config().max_message_size)
        .on_upgrade(move |socket| run_peer_session(socket, peer_id, codec, shared))
}

fn reject(status: StatusCode) -> Response {
    counter!("rpc_handshake_rejections_total", "status" => status.as_str().to_owned()).increment(1);
    (status, status.canonical_reason().unwrap_or_default()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(id: Option<&str>, secret: Option<&str>) -> HandshakeQuery {
        HandshakeQuery {
            id: id.map(str::to_owned),
            secret: secret.map(str::to_owned),
            codec: None,
        }
    }

    #[test]
    fn missing_id_is_unauthorized() {
        assert_eq!(authorize(&query(None, None), None), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(authorize(&query(Some(""), None), None), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn id_without_configured_secret_passes() {
        assert_eq!(authorize(&query(Some("c1"), Some("anything")), None), Ok("c1".into()));
    }

    #[test]
    fn secret_must_match_exactly() {
        assert_eq!(authorize(&query(Some("c1"), Some("s3cret")), Some("s3cret")), Ok("c1".into()));
        assert_eq!(
            authorize(&query(Some("c1"), Some("S3CRET")), Some("s3cret")),
            Err(StatusCode::UNAUTHORIZED)
        );
        assert_eq!(authorize(&query(Some("c1"), None), Some("s3cret")), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn codec_negotiation() {
        let mut q = query(Some("c1"), None);
        assert_eq!(negotiate_codec(&q, Codec::Json), Codec::Json);
        q.codec = Some("clone".into());
        assert_eq!(negotiate_codec(&q, Codec::Json), Codec::Clone);
        q.codec = Some("yaml".into());
        assert_eq!(negotiate_codec(&q, Codec::Clone), Codec::Clone);
    }
}
