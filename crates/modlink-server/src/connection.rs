//! Per-connection state: outbound queue and the suspended task table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use modlink_core::{Codec, Response};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::tasks::TaskOp;

/// Item for the connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Encode and send a frame.
    Frame(Response),
    /// Send a close frame and stop writing.
    Close,
}

/// Handle to the worker owning one task id.
#[derive(Debug)]
pub struct TaskHandle {
    serial: u64,
    tx: mpsc::UnboundedSender<TaskOp>,
    suspended: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Unique number distinguishing reuses of the same task id.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether the task holds a suspended generator.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Queue an operation. Returns `false` once the worker has exited.
    pub fn send(&self, op: TaskOp) -> bool {
        self.tx.send(op).is_ok()
    }
}

/// A connected peer.
#[derive(Debug)]
pub struct PeerConnection {
    /// Unique connection id.
    pub conn_id: String,
    /// Id the peer announced during the handshake.
    pub peer_id: String,
    /// Negotiated codec.
    pub codec: Codec,
    /// When this connection was established.
    pub connected_at: Instant,
    tx: mpsc::UnboundedSender<Outbound>,
    tasks: Mutex<HashMap<u64, TaskHandle>>,
    next_serial: AtomicU64,
}

impl PeerConnection {
    /// Create a connection writing to `tx`.
    pub fn new(peer_id: String, codec: Codec, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            conn_id: uuid::Uuid::now_v7().simple().to_string(),
            peer_id,
            codec,
            connected_at: Instant::now(),
            tx,
            tasks: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Queue a frame. Returns `false` if the writer is gone.
    pub fn send(&self, frame: Response) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Ask the writer to close the socket.
    pub fn close(&self) -> bool {
        self.tx.send(Outbound::Close).is_ok()
    }

    /// Register a task worker and return its serial and suspension flag.
    /// Replaces any task already using `task_id`.
    pub fn insert_task(&self, task_id: u64, tx: mpsc::UnboundedSender<TaskOp>) -> (u64, Arc<AtomicBool>) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let suspended = Arc::new(AtomicBool::new(false));
        let handle = TaskHandle {
            serial,
            tx,
            suspended: Arc::clone(&suspended),
        };
        let _ = self.tasks.lock().insert(task_id, handle);
        (serial, suspended)
    }

    /// Forward `op` to the worker of `task_id`. Returns `false` when no live
    /// worker owns the id.
    pub fn forward(&self, task_id: u64, op: TaskOp) -> bool {
        self.tasks.lock().get(&task_id).is_some_and(|handle| handle.send(op))
    }

    /// Drop the entry for `task_id` if it still belongs to `serial`.
    pub fn finish_task(&self, task_id: u64, serial: u64) {
        let mut tasks = self.tasks.lock();
        if tasks.get(&task_id).is_some_and(|handle| handle.serial == serial) {
            let _ = tasks.remove(&task_id);
        }
    }

    /// Remove and return every task.
    pub fn take_tasks(&self) -> Vec<TaskHandle> {
        self.tasks.lock().drain().map(|(_, handle)| handle).collect()
    }

    /// Number of suspended generator tasks.
    pub fn suspended_tasks(&self) -> usize {
        self.tasks.lock().values().filter(|handle| handle.is_suspended()).count()
    }

    /// Number of task entries, running or suspended.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
