//! Peer session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use modlink_core::{ChannelError, Codec, Event, Payload, Request, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::connection::{Outbound, PeerConnection};
use crate::server::ServerShared;
use crate::tasks;

/// How long the writer gets to flush the close frame after the reader stops.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Run a session for an upgraded socket.
///
/// 1. Queues `[CONNECT, serverId, codec]` ahead of any other frame
/// 2. Decodes frames and dispatches them strictly in arrival order
/// 3. Forwards outbound frames through a dedicated writer task
/// 4. On disconnect drops the peer and returns its suspended generators
#[instrument(skip_all, fields(peer_id = %peer_id))]
pub async fn run_peer_session(socket: WebSocket, peer_id: String, codec: Codec, shared: Arc<ServerShared>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = Arc::new(PeerConnection::new(peer_id.clone(), codec, send_tx));
    let cancel = shared.shutdown_token();

    let started = Instant::now();
    info!(conn_id = %conn.conn_id, %codec, "peer connected");
    counter!("rpc_connections_total").increment(1);
    gauge!("rpc_connections_active").increment(1.0);

    let _ = conn.send(Response::connect(&shared.id(), codec.as_str()));
    shared.peers.add(Arc::clone(&conn)).await;

    let writer_sink = shared.sink.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(item) = send_rx.recv().await {
            let frame = match item {
                Outbound::Frame(frame) => frame,
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            let message = match codec.encode(&frame) {
                Ok(Payload::Text(text)) => Message::Text(text.into()),
                Ok(Payload::Binary(bytes)) => Message::Binary(bytes.into()),
                Err(err) => {
                    writer_sink.report(&err);
                    continue;
                }
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let payload = match msg {
            Some(Ok(Message::Text(text))) => Payload::Text(text.as_str().to_owned()),
            Some(Ok(Message::Binary(bytes))) => Payload::Binary(bytes.to_vec()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(err)) => {
                debug!(error = %err, "socket read failed");
                break;
            }
        };
        match codec.decode::<Request>(&payload) {
            Ok(request) => dispatch(&shared, &conn, request),
            Err(err) => shared.sink.report(&ChannelError::Protocol(format!(
                "malformed frame from {peer_id}: {err}"
            ))),
        }
    }

    // Clean up
    info!(conn_id = %conn.conn_id, "peer disconnected");
    counter!("rpc_disconnections_total").increment(1);
    gauge!("rpc_connections_active").decrement(1.0);
    histogram!("rpc_connection_duration_seconds").record(started.elapsed().as_secs_f64());

    let _ = shared.peers.remove(&conn.conn_id).await;
    // Dropping the handles closes the op channels; workers return their generators.
    drop(conn.take_tasks());
    let _ = conn.close();
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Route one decoded frame.
fn dispatch(shared: &ServerShared, conn: &Arc<PeerConnection>, request: Request) {
    counter!("rpc_requests_total", "event" => request.event.as_str()).increment(1);
    match request.event {
        Event::Invoke => tasks::spawn_invoke(shared.ctx(), conn, request),
        Event::Yield | Event::Return | Event::Throw => tasks::forward_op(conn, request),
        Event::Ping => {
            let _ = conn.send(Response::pong(request.task_id));
        }
        other => shared.sink.report(&ChannelError::Protocol(format!(
            "unexpected {other} frame from {}",
            conn.peer_id
        ))),
    }
}
