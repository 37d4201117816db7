//! In-process call path.
//!
//! A local call starts executing as soon as it is created, like a remote call
//! whose INVOKE frame is already on the wire. It never serializes arguments
//! but answers every operation exactly like a remote call would.

use std::panic::Location;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::call::{Call, CallRequest, Invocation};
use crate::errors::{ChannelError, RemoteError, Result};
use crate::module::{Generator, Module, Outcome};
use crate::registry::RegistryEntry;
use crate::routing::CallTarget;
use crate::task::Operation;

enum LocalState {
    Pending(JoinHandle<std::result::Result<Outcome, RemoteError>>),
    Open(Box<dyn Generator>),
    Closed(Result<Value>),
}

/// Call executing against an in-process module.
pub struct LocalCall {
    module: String,
    method: String,
    site: &'static Location<'static>,
    state: LocalState,
}

impl LocalCall {
    /// Start `request` on `module`. Must run inside a tokio runtime.
    pub fn spawn(module: Arc<dyn Module>, request: CallRequest) -> Self {
        let CallRequest {
            module: name,
            method,
            args,
            site,
        } = request;
        let target = method.clone();
        let handle = tokio::spawn(async move { module.call(&target, args).await });
        Self {
            module: name,
            method,
            site,
            state: LocalState::Pending(handle),
        }
    }

    fn fail(&self, err: RemoteError) -> ChannelError {
        ChannelError::Remote(err).with_call_site(self.site)
    }

    fn missing_task(&self) -> ChannelError {
        self.fail(RemoteError::reference_error(format!(
            "Failed to call {}.{}()",
            self.module, self.method
        )))
    }

    async fn settle_pending(&mut self, op: &Operation) -> Result<()> {
        let LocalState::Pending(handle) = &mut self.state else {
            return Ok(());
        };
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join) => Err(RemoteError::error(format!(
                "{}.{}() aborted: {join}",
                self.module, self.method
            ))),
        };
        match outcome {
            Ok(Outcome::Value(value)) => {
                self.state = LocalState::Closed(Ok(value));
                if *op != Operation::Invoke {
                    return Err(self.missing_task());
                }
            }
            Ok(Outcome::Generator(generator)) => self.state = LocalState::Open(generator),
            Err(err) => {
                let err = self.fail(err);
                self.state = LocalState::Closed(Err(err.clone()));
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Invocation for LocalCall {
    async fn apply(&mut self, op: Operation) -> Result<Value> {
        self.settle_pending(&op).await?;

        let step = match &mut self.state {
            LocalState::Closed(stored) => return op.settle_closed(stored.clone()),
            LocalState::Pending(_) => {
                return Err(ChannelError::InvalidState(format!(
                    "{}.{}() has not settled",
                    self.module, self.method
                )));
            }
            LocalState::Open(generator) => match op {
                Operation::Invoke => None,
                Operation::Next(input) => Some(generator.next(input).await),
                Operation::Return(value) => Some(generator.return_value(value).await),
                Operation::Throw(error) => Some(generator.throw(error).await),
            },
        };

        match step {
            None => {
                self.state = LocalState::Closed(Ok(Value::Null));
                Ok(Value::Null)
            }
            Some(Ok(result)) => {
                if result.done {
                    self.state = LocalState::Closed(Ok(result.value.clone()));
                }
                Ok(result.to_value())
            }
            Some(Err(err)) => {
                let err = self.fail(err);
                self.state = LocalState::Closed(Err(err.clone()));
                Err(err)
            }
        }
    }
}

/// Start a call on a registry entry after the readiness and method checks.
pub fn invoke_entry(entry: &RegistryEntry, request: CallRequest, check_ready: bool) -> Call {
    if check_ready && !entry.is_ready() {
        return Call::failed(ChannelError::unavailable(&request.module));
    }
    if !entry.descriptor().has_method(&request.method) {
        return Call::failed(ChannelError::not_a_function(&request.module, &request.method));
    }
    Call::new(LocalCall::spawn(Arc::clone(entry.module()), request))
}

/// Routing target backed by a registry entry of this process.
#[derive(Debug)]
pub struct LocalTarget {
    entry: Arc<RegistryEntry>,
}

impl LocalTarget {
    /// Target calling `entry`.
    pub fn new(entry: Arc<RegistryEntry>) -> Self {
        Self { entry }
    }
}

impl CallTarget for LocalTarget {
    fn invoke(&self, request: CallRequest) -> Call {
        invoke_entry(&self.entry, request, true)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
