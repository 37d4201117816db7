//! Outstanding task table of a client.
//!
//! Every call gets a task id. A slot holds the waiters for answers to
//! operations sent on that task, oldest first; the server answers the
//! operations of one task in order.

use std::collections::{HashMap, HashSet, VecDeque};

use modlink_core::{ChannelError, Event, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

/// Largest task id before the counter wraps.
pub const MAX_TASK_ID: u64 = (1 << 53) - 1;

/// One answer frame for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Event of the answer frame.
    pub event: Event,
    /// Payload, absent for bare acknowledgements.
    pub data: Option<Value>,
}

/// Receiving end of one pending answer.
pub type ReplyReceiver = oneshot::Receiver<Result<Reply>>;

type Waiter = oneshot::Sender<Result<Reply>>;

#[derive(Default)]
struct TableState {
    last_id: u64,
    slots: HashMap<u64, VecDeque<Waiter>>,
}

/// Outstanding tasks keyed by id.
#[derive(Default)]
pub struct TaskTable {
    state: Mutex<TableState>,
}

impl TaskTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a task id and wait for its first answer.
    ///
    /// Ids increase monotonically, wrap after [`MAX_TASK_ID`] and skip ids
    /// still in use.
    pub fn open(&self) -> (u64, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        let id = loop {
            state.last_id = if state.last_id >= MAX_TASK_ID { 1 } else { state.last_id + 1 };
            if !state.slots.contains_key(&state.last_id) {
                break state.last_id;
            }
        };
        let _ = state.slots.insert(id, VecDeque::from([tx]));
        (id, rx)
    }

    /// Wait for the next answer on an open task. `None` if the task is gone.
    pub fn enqueue(&self, id: u64) -> Option<ReplyReceiver> {
        let mut state = self.state.lock();
        let slot = state.slots.get_mut(&id)?;
        let (tx, rx) = oneshot::channel();
        slot.push_back(tx);
        Some(rx)
    }

    /// Deliver an answer to the oldest waiter of `id`. Returns `false` when
    /// nobody was waiting.
    pub fn resolve(&self, id: u64, reply: Reply) -> bool {
        let waiter = self.state.lock().slots.get_mut(&id).and_then(VecDeque::pop_front);
        match waiter {
            Some(tx) => tx.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    /// Drop a task and its waiters.
    pub fn remove(&self, id: u64) -> bool {
        self.state.lock().slots.remove(&id).is_some()
    }

    /// Fail every task except those in `keep` with `error`. Returns how many
    /// tasks were dropped.
    pub fn fail_all(&self, error: &ChannelError, keep: &HashSet<u64>) -> usize {
        let drained: Vec<VecDeque<Waiter>> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state.slots.keys().copied().filter(|id| !keep.contains(id)).collect();
            ids.iter().filter_map(|id| state.slots.remove(id)).collect()
        };
        let count = drained.len();
        for tx in drained.into_iter().flatten() {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Whether `id` is still open.
    pub fn contains(&self, id: u64) -> bool {
        self.state.lock().slots.contains_key(&id)
    }

    /// Number of open tasks.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Whether no task is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn set_last_id(&self, id: u64) {
        self.state.lock().last_id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(event: Event, data: Value) -> Reply {
        Reply { event, data: Some(data) }
    }

    #[test]
    fn ids_increase() {
        let table = TaskTable::new();
        let (a, _ra) = table.open();
        let (b, _rb) = table.open();
        assert_eq!((a, b), (1, 2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn ids_wrap_and_skip_open_tasks() {
        let table = TaskTable::new();
        let (first, _r1) = table.open();
        table.set_last_id(MAX_TASK_ID - 1);
        let (last, _r2) = table.open();
        assert_eq!(last, MAX_TASK_ID);
        let (wrapped, _r3) = table.open();
        assert_eq!(first, 1);
        assert_eq!(wrapped, 2);
    }

    #[tokio::test]
    async fn answers_reach_waiters_in_order() {
        let table = TaskTable::new();
        let (id, first) = table.open();
        let second = table.enqueue(id).unwrap();

        assert!(table.resolve(id, reply(Event::Invoke, Value::Null)));
        assert!(table.resolve(id, reply(Event::Yield, json!({"value": 1, "done": false}))));

        assert_eq!(first.await.unwrap().unwrap().event, Event::Invoke);
        assert_eq!(second.await.unwrap().unwrap().event, Event::Yield);
        assert!(!table.resolve(id, reply(Event::Return, Value::Null)));
    }

    #[test]
    fn removed_task_takes_no_more_waiters() {
        let table = TaskTable::new();
        let (id, _rx) = table.open();
        assert!(table.remove(id));
        assert!(!table.remove(id));
        assert!(table.enqueue(id).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_spares_kept_tasks() {
        let table = TaskTable::new();
        let (lost, lost_rx) = table.open();
        let (kept, _kept_rx) = table.open();

        let dropped = table.fail_all(&ChannelError::Transport("gone".into()), &HashSet::from([kept]));
        assert_eq!(dropped, 1);
        assert!(!table.contains(lost));
        assert!(table.contains(kept));
        let err = lost_rx.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "gone");
    }
}
