//! Call handles.
//!
//! A [`Call`] is what every method invocation returns, whether it runs in
//! this process or on a remote server. Awaiting it yields the method's value;
//! `next` / `return_value` / `throw` drive it as a generator. Once a call has
//! closed (finished, failed or timed out) further operations answer with
//! closed-call semantics (see [`Operation::settle_closed`]).

use std::fmt;
use std::future::IntoFuture;
use std::panic::Location;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::errors::{ChannelError, RemoteError, Result};
use crate::protocol::IterResult;
use crate::task::Operation;

/// A method invocation before it is dispatched to a target.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Module name.
    pub module: String,
    /// Method name.
    pub method: String,
    /// Positional arguments; the first one doubles as routing key.
    pub args: Vec<Value>,
    /// Source location of the caller, appended to error stacks.
    pub site: &'static Location<'static>,
}

impl CallRequest {
    /// Request recorded at the caller's location.
    #[track_caller]
    pub fn new(module: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            module: module.into(),
            method: method.into(),
            args,
            site: Location::caller(),
        }
    }

    /// First argument, used to pick among providers.
    pub fn route_key(&self) -> Option<&Value> {
        self.args.first()
    }

    /// `module.method`.
    pub fn callee(&self) -> String {
        format!("{}.{}", self.module, self.method)
    }
}

/// Backend of a [`Call`].
#[async_trait]
pub trait Invocation: Send {
    /// Apply one operation and return its raw answer: the call value for
    /// [`Operation::Invoke`], a `{value, done}` object otherwise.
    async fn apply(&mut self, op: Operation) -> Result<Value>;
}

/// Handle to one invocation.
pub struct Call {
    inner: Box<dyn Invocation>,
}

impl Call {
    /// Wrap an invocation backend.
    pub fn new(inner: impl Invocation + 'static) -> Self {
        Self { inner: Box::new(inner) }
    }

    /// A call that fails every operation with `error`.
    pub fn failed(error: ChannelError) -> Self {
        Self::new(FailedCall(error))
    }

    /// Wait for the call's value. Awaiting a generator call yields `null`
    /// and closes it.
    pub async fn result(&mut self) -> Result<Value> {
        self.inner.apply(Operation::Invoke).await
    }

    /// Resume the generator with `input`.
    pub async fn next(&mut self, input: Value) -> Result<IterResult> {
        let raw = self.inner.apply(Operation::Next(input)).await?;
        IterResult::from_value(raw)
    }

    /// Finish the generator early with `value`.
    pub async fn return_value(&mut self, value: Value) -> Result<IterResult> {
        let raw = self.inner.apply(Operation::Return(value)).await?;
        IterResult::from_value(raw)
    }

    /// Raise `error` inside the generator.
    pub async fn throw(&mut self, error: RemoteError) -> Result<IterResult> {
        let raw = self.inner.apply(Operation::Throw(error)).await?;
        IterResult::from_value(raw)
    }
}

impl IntoFuture for Call {
    type Output = Result<Value>;
    type IntoFuture = BoxFuture<'static, Result<Value>>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move { self.result().await })
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call").finish_non_exhaustive()
    }
}

struct FailedCall(ChannelError);

#[async_trait]
impl Invocation for FailedCall {
    async fn apply(&mut self, _op: Operation) -> Result<Value> {
        Err(self.0.clone())
    }
}
