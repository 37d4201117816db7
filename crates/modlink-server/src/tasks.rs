//! Task workers.
//!
//! Every INVOKE gets a worker that owns the call. Plain values are answered
//! with RETURN and the worker exits. A generator is acknowledged with a bare
//! INVOKE and stays suspended: the worker applies YIELD / RETURN / THROW
//! operations in the order they arrived until the generator finishes, fails,
//! is force-returned or its connection goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::gauge;
use modlink_core::{
    AppContext, ChannelError, Event, Generator, Module, Operation, Outcome, RegistryEntry, RemoteError, Request,
    Response,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::connection::PeerConnection;

/// Operation queued for a task worker.
#[derive(Debug)]
pub enum TaskOp {
    /// Apply a generator operation received from the peer.
    Apply(Operation),
    /// Finish the generator with `return(null)` and acknowledge.
    ForceReturn(oneshot::Sender<()>),
}

/// Handle an INVOKE frame.
pub fn spawn_invoke(ctx: &AppContext, conn: &Arc<PeerConnection>, request: Request) {
    let task_id = request.task_id;
    let module = request.module.unwrap_or_default();
    let method = request.method.unwrap_or_default();

    let entry = match resolve(ctx, &module, &method) {
        Ok(entry) => entry,
        Err(err) => {
            debug!(task_id, module, method, error = %err, "rejecting invoke");
            let _ = conn.send(throw(task_id, &err.to_remote()));
            return;
        }
    };

    let (tx, ops) = mpsc::unbounded_channel();
    let (serial, suspended) = conn.insert_task(task_id, tx);
    let worker = TaskWorker {
        conn: Arc::clone(conn),
        task_id,
        serial,
        suspended,
        module,
        method,
        ops,
    };
    let target = Arc::clone(entry.module());
    let _ = tokio::spawn(worker.run(target, request.args));
}

/// Handle a YIELD / RETURN / THROW frame.
pub fn forward_op(conn: &PeerConnection, request: Request) {
    let task_id = request.task_id;
    let Some(op) = Operation::from_request(request.event, request.first_arg()) else {
        return;
    };
    if !conn.forward(task_id, TaskOp::Apply(op)) {
        let module = request.module.unwrap_or_default();
        let method = request.method.unwrap_or_default();
        let _ = conn.send(missing_task(task_id, &module, &method));
    }
}

fn resolve(ctx: &AppContext, module: &str, method: &str) -> Result<Arc<RegistryEntry>, ChannelError> {
    let entry = ctx
        .registry()
        .get(module)
        .ok_or_else(|| ChannelError::not_a_function(module, method))?;
    if !entry.descriptor().has_method(method) {
        return Err(ChannelError::not_a_function(module, method));
    }
    if !entry.is_ready() {
        return Err(ChannelError::unavailable(module));
    }
    Ok(entry)
}

fn throw(task_id: u64, err: &RemoteError) -> Response {
    Response::task(Event::Throw, task_id, Some(err.to_value()))
}

fn missing_task(task_id: u64, module: &str, method: &str) -> Response {
    let err = RemoteError::reference_error(format!("Failed to call {module}.{method}()"));
    throw(task_id, &err)
}

struct TaskWorker {
    conn: Arc<PeerConnection>,
    task_id: u64,
    serial: u64,
    suspended: Arc<AtomicBool>,
    module: String,
    method: String,
    ops: mpsc::UnboundedReceiver<TaskOp>,
}

impl TaskWorker {
    async fn run(mut self, target: Arc<dyn Module>, args: Vec<Value>) {
        match target.call(&self.method, args).await {
            Ok(Outcome::Value(value)) => {
                let _ = self.conn.send(Response::task(Event::Return, self.task_id, Some(value)));
            }
            Ok(Outcome::Generator(generator)) => {
                self.suspended.store(true, Ordering::Release);
                gauge!("rpc_tasks_suspended").increment(1.0);
                let _ = self.conn.send(Response::task(Event::Invoke, self.task_id, None));
                self.drive(generator).await;
                gauge!("rpc_tasks_suspended").decrement(1.0);
            }
            Err(err) => {
                let _ = self.conn.send(throw(self.task_id, &err));
            }
        }
        self.finish();
    }

    async fn drive(&mut self, mut generator: Box<dyn Generator>) {
        while let Some(op) = self.ops.recv().await {
            let op = match op {
                TaskOp::ForceReturn(ack) => {
                    debug!(task_id = self.task_id, "force-returning suspended task");
                    let _ = generator.return_value(Value::Null).await;
                    let _ = ack.send(());
                    return;
                }
                TaskOp::Apply(op) => op,
            };

            let event = op.event();
            let step = match op {
                Operation::Invoke => continue,
                Operation::Next(input) => generator.next(input).await,
                Operation::Return(value) => generator.return_value(value).await,
                Operation::Throw(error) => generator.throw(error).await,
            };

            match step {
                Ok(result) if result.done => {
                    let _ = self
                        .conn
                        .send(Response::task(Event::Return, self.task_id, Some(result.to_value())));
                    return;
                }
                Ok(result) => {
                    // A throw the generator recovered from answers like a yield.
                    let event = if event == Event::Throw { Event::Yield } else { event };
                    let _ = self.conn.send(Response::task(event, self.task_id, Some(result.to_value())));
                }
                Err(err) => {
                    let _ = self.conn.send(throw(self.task_id, &err));
                    return;
                }
            }
        }

        debug!(task_id = self.task_id, "connection gone, returning suspended task");
        let _ = generator.return_value(Value::Null).await;
    }

    /// Free the task id and answer whatever was queued behind the last step.
    fn finish(&mut self) {
        self.conn.finish_task(self.task_id, self.serial);
        self.ops.close();
        while let Ok(op) = self.ops.try_recv() {
            match op {
                TaskOp::Apply(_) => {
                    let _ = self.conn.send(missing_task(self.task_id, &self.module, &self.method));
                }
                TaskOp::ForceReturn(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use modlink_core::{FnModule, IterResult, StreamGenerator, Target};
    use serde_json::json;

    async fn context() -> Arc<AppContext> {
        let ctx = AppContext::new();
        let detail = FnModule::new("detail")
            .method("getName", |_| async { Ok(json!("modlink")) })
            .method("fail", |_| async { Err(RemoteError::type_error("bad input")) })
            .generator("getOrgs", |_| {
                StreamGenerator::new(futures::stream::iter(vec![Ok(json!("a")), Ok(json!("b"))]))
                    .with_output(json!("end"))
            });
        let _ = ctx.register_local(Arc::new(detail)).await;
        ctx
    }

    fn connection() -> (Arc<PeerConnection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(PeerConnection::new("peer".into(), modlink_core::Codec::Json, tx)), rx)
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Response {
        match rx.recv().await {
            Some(Outbound::Frame(frame)) => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    fn op(event: Event, task_id: u64, input: Value) -> Request {
        Request::generator(event, task_id, "detail", "getOrgs", input)
    }

    #[tokio::test]
    async fn plain_value_answers_return() {
        let ctx = context().await;
        let (conn, mut rx) = connection();
        spawn_invoke(&ctx, &conn, Request::invoke(1, "detail", "getName", vec![]));
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame, Response::task(Event::Return, 1, Some(json!("modlink"))));
    }

    #[tokio::test]
    async fn unknown_method_answers_type_error() {
        let ctx = context().await;
        let (conn, mut rx) = connection();
        spawn_invoke(&ctx, &conn, Request::invoke(2, "detail", "setName", vec![]));
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.event, Event::Throw);
        let err = RemoteError::from_value(frame.data.unwrap());
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "detail.setName is not a function");
        assert_eq!(conn.task_count(), 0);
    }

    #[tokio::test]
    async fn module_error_answers_throw() {
        let ctx = context().await;
        let (conn, mut rx) = connection();
        spawn_invoke(&ctx, &conn, Request::invoke(3, "detail", "fail", vec![]));
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.event, Event::Throw);
        assert_eq!(RemoteError::from_value(frame.data.unwrap()).message, "bad input");
    }

    #[tokio::test]
    async fn generator_operations_answer_in_order() {
        let ctx = context().await;
        let (conn, mut rx) = connection();
        spawn_invoke(&ctx, &conn, Request::invoke(4, "detail", "getOrgs", vec![]));
        forward_op(&conn, op(Event::Yield, 4, Value::Null));
        forward_op(&conn, op(Event::Yield, 4, Value::Null));
        forward_op(&conn, op(Event::Return, 4, json!("stop")));
        forward_op(&conn, op(Event::Yield, 4, Value::Null));

        assert_eq!(next_frame(&mut rx).await, Response::task(Event::Invoke, 4, None));
        assert_eq!(
            next_frame(&mut rx).await,
            Response::task(Event::Yield, 4, Some(IterResult::yielded(json!("a")).to_value()))
        );
        assert_eq!(
            next_frame(&mut rx).await,
            Response::task(Event::Yield, 4, Some(IterResult::yielded(json!("b")).to_value()))
        );
        assert_eq!(
            next_frame(&mut rx).await,
            Response::task(Event::Return, 4, Some(IterResult::done(json!("stop")).to_value()))
        );
        let late = next_frame(&mut rx).await;
        assert_eq!(late.event, Event::Throw);
        assert_eq!(
            RemoteError::from_value(late.data.unwrap()).to_string(),
            "ReferenceError: Failed to call detail.getOrgs()"
        );
        assert_eq!(conn.task_count(), 0);
    }

    #[tokio::test]
    async fn unknown_task_answers_reference_error() {
        let (conn, mut rx) = connection();
        forward_op(&conn, op(Event::Yield, 99, Value::Null));
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.target, Target::Task(99));
        assert_eq!(RemoteError::from_value(frame.data.unwrap()).name, "ReferenceError");
    }

    #[tokio::test]
    async fn force_return_acknowledges_and_frees() {
        let ctx = context().await;
        let (conn, mut rx) = connection();
        spawn_invoke(&ctx, &conn, Request::invoke(5, "detail", "getOrgs", vec![]));
        assert_eq!(next_frame(&mut rx).await.event, Event::Invoke);
        assert_eq!(conn.suspended_tasks(), 1);

        let (ack_tx, ack_rx) = oneshot::channel();
        let handle = conn.take_tasks().pop().unwrap();
        assert!(handle.send(TaskOp::ForceReturn(ack_tx)));
        ack_rx.await.unwrap();
        assert_eq!(conn.suspended_tasks(), 0);
    }
}
