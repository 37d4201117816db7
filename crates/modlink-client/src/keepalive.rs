//! Ping/pong liveness monitoring for a client socket.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Outcome of the keepalive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveResult {
    /// No pong arrived within the timeout window.
    TimedOut,
    /// The ping could not be queued; the socket is already gone.
    Disconnected,
    /// The loop was cancelled externally.
    Cancelled,
}

/// Run keepalive pings for one socket.
///
/// Every `interval` a `[PING, now]` frame is queued through `ping`. The loop
/// then waits up to `timeout` for `pong` to be notified. Any pong counts,
/// including WebSocket-level pongs.
pub async fn run_keepalive<F>(
    ping: F,
    pong: Arc<Notify>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> KeepaliveResult
where
    F: Fn(u64) -> bool,
{
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => return KeepaliveResult::Cancelled,
        }
        if !ping(now_millis()) {
            return KeepaliveResult::Disconnected;
        }
        tokio::select! {
            () = pong.notified() => {}
            () = time::sleep(timeout) => return KeepaliveResult::TimedOut,
            () = cancel.cancelled() => return KeepaliveResult::Cancelled,
        }
    }
}

/// Milliseconds since the Unix epoch, as carried in `PING` frames.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
