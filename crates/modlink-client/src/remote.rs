//! Calls executed on the server a client is connected to.
//!
//! The `INVOKE` frame goes out as soon as the call is created; awaiting the
//! handle only collects the answer. While the client is reconnecting frames
//! are held back and flushed once the next handshake completes.

use std::panic::Location;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use modlink_core::{
    Call, CallRequest, CallTarget, ChannelError, Event, Invocation, IterResult, ModuleDescriptor, Operation,
    RemoteError, Request, Result,
};
use serde_json::Value;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::client::{ClientInner, ClientState};
use crate::tasks::{Reply, ReplyReceiver};

/// Routing target for a module served by the remote end of a client.
pub struct RemoteTarget {
    client: Weak<ClientInner>,
    descriptor: ModuleDescriptor,
}

impl RemoteTarget {
    pub(crate) fn new(client: Weak<ClientInner>, descriptor: ModuleDescriptor) -> Self {
        Self { client, descriptor }
    }
}

impl CallTarget for RemoteTarget {
    fn invoke(&self, request: CallRequest) -> Call {
        if !self.descriptor.has_method(&request.method) {
            return Call::failed(ChannelError::not_a_function(&request.module, &request.method));
        }
        let Some(client) = self.client.upgrade() else {
            return Call::failed(ChannelError::unavailable(&request.module));
        };
        // The server lives in this process: skip the socket.
        if client.ctx.registry().contains(&request.module) && client.ctx.is_local_server(&client.server_id()) {
            return client.ctx.call_local(request, true);
        }
        if client.state() == ClientState::Closed {
            return Call::failed(ChannelError::unavailable(&request.module));
        }
        RemoteCall::start(client, request)
    }
}

enum RemoteState {
    Invoking { rx: ReplyReceiver, deadline: Instant },
    Open,
    Closed(Result<Value>),
}

struct RemoteCall {
    client: Arc<ClientInner>,
    task_id: u64,
    module: String,
    method: String,
    site: &'static Location<'static>,
    timeout: Duration,
    state: RemoteState,
}

impl RemoteCall {
    fn start(client: Arc<ClientInner>, request: CallRequest) -> Call {
        let CallRequest {
            module,
            method,
            args,
            site,
        } = request;
        let timeout = client.config.timeout();
        let (task_id, rx) = client.tasks.open();
        if let Err(err) = client.send(Request::invoke(task_id, &module, &method, args)) {
            let _ = client.tasks.remove(task_id);
            return Call::failed(err);
        }
        counter!("rpc_client_calls_total").increment(1);
        debug!(task_id, module = %module, method = %method, "call sent");
        Call::new(Self {
            client,
            task_id,
            module,
            method,
            site,
            timeout,
            state: RemoteState::Invoking {
                rx,
                deadline: Instant::now() + timeout,
            },
        })
    }

    async fn await_reply(&self, rx: ReplyReceiver, deadline: Instant) -> Result<Reply> {
        match time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ChannelError::Transport(format!(
                "connection to {} closed",
                self.client.server_id()
            ))),
            Err(_) => {
                counter!("rpc_client_timeouts_total").increment(1);
                Err(ChannelError::timeout(&self.module, &self.method, self.timeout))
            }
        }
    }

    fn close(&mut self, outcome: Result<Value>) -> Result<Value> {
        let _ = self.client.tasks.remove(self.task_id);
        self.state = RemoteState::Closed(outcome.clone());
        outcome
    }

    fn thrown(&self, data: Option<Value>) -> ChannelError {
        ChannelError::Remote(RemoteError::from_value(data.unwrap_or(Value::Null))).with_call_site(self.site)
    }

    fn missing_task(&self) -> ChannelError {
        ChannelError::Remote(RemoteError::reference_error(format!(
            "Failed to call {}.{}()",
            self.module, self.method
        )))
        .with_call_site(self.site)
    }

    fn frame(&self, event: Event, input: Value) -> Request {
        Request::generator(event, self.task_id, &self.module, &self.method, input)
    }

    /// Settle the `INVOKE` answer. Leaves the call `Open` for a suspended
    /// generator, `Closed` otherwise.
    async fn settle_invoke(&mut self, op: &Operation, rx: ReplyReceiver, deadline: Instant) -> Result<()> {
        let reply = match self.await_reply(rx, deadline).await {
            Ok(reply) => reply,
            Err(err) => return self.close(Err(err)).map(drop),
        };
        match reply.event {
            Event::Invoke => {
                self.state = RemoteState::Open;
                Ok(())
            }
            Event::Throw => {
                let err = self.thrown(reply.data);
                self.close(Err(err)).map(drop)
            }
            _ => {
                let _ = self.close(Ok(reply.data.unwrap_or(Value::Null)));
                if *op == Operation::Invoke {
                    Ok(())
                } else {
                    Err(self.missing_task())
                }
            }
        }
    }

    async fn step(&mut self, op: Operation) -> Result<Value> {
        if op == Operation::Invoke {
            // Awaiting a suspended generator closes it.
            let _ = self.client.send(self.frame(Event::Return, Value::Null));
            return self.close(Ok(Value::Null));
        }
        let Some(rx) = self.client.tasks.enqueue(self.task_id) else {
            let err = ChannelError::Transport(format!("connection to {} lost", self.client.server_id()));
            return self.close(Err(err));
        };
        let deadline = Instant::now() + self.timeout;
        if let Err(err) = self.client.send(self.frame(op.event(), op.input())) {
            return self.close(Err(err));
        }
        let reply = match self.await_reply(rx, deadline).await {
            Ok(reply) => reply,
            Err(err) => return self.close(Err(err)),
        };
        if reply.event == Event::Throw {
            let err = self.thrown(reply.data);
            return self.close(Err(err));
        }
        let raw = reply.data.unwrap_or(Value::Null);
        match IterResult::from_value(raw.clone()) {
            Ok(result) if result.done => {
                let _ = self.close(Ok(result.value));
                Ok(raw)
            }
            Ok(_) => Ok(raw),
            Err(err) => self.close(Err(err)),
        }
    }
}

#[async_trait]
impl Invocation for RemoteCall {
    async fn apply(&mut self, op: Operation) -> Result<Value> {
        match std::mem::replace(&mut self.state, RemoteState::Open) {
            RemoteState::Closed(stored) => {
                self.state = RemoteState::Closed(stored.clone());
                return op.settle_closed(stored);
            }
            RemoteState::Invoking { rx, deadline } => {
                self.settle_invoke(&op, rx, deadline).await?;
                if let RemoteState::Closed(stored) = &self.state {
                    return op.settle_closed(stored.clone());
                }
            }
            RemoteState::Open => {}
        }
        self.step(op).await
    }
}

impl Drop for RemoteCall {
    fn drop(&mut self) {
        match self.state {
            RemoteState::Closed(_) => {}
            RemoteState::Open => {
                let _ = self.client.send(self.frame(Event::Return, Value::Null));
                let _ = self.client.tasks.remove(self.task_id);
            }
            RemoteState::Invoking { .. } => {
                let _ = self.client.tasks.remove(self.task_id);
            }
        }
    }
}
