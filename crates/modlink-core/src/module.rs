//! Module interface.
//!
//! A module is a named object with a fixed method set. Calling a method yields
//! either a plain value or a generator that the caller drives step by step.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RemoteError;
use crate::protocol::IterResult;

/// Module name and the methods it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    name: String,
    methods: BTreeSet<String>,
}

impl ModuleDescriptor {
    /// Descriptor for `name` with the given methods.
    pub fn new<I, S>(name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    /// Dot-separated module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Method names, sorted.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    /// Whether `method` is part of the module.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    /// Same descriptor with one more method.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        let _ = self.methods.insert(method.into());
        self
    }
}

/// A suspended generator.
#[async_trait]
pub trait Generator: Send {
    /// Resume with `input`.
    async fn next(&mut self, input: Value) -> Result<IterResult, RemoteError>;

    /// Finish early with `value`.
    async fn return_value(&mut self, value: Value) -> Result<IterResult, RemoteError>;

    /// Raise `error` at the suspension point.
    async fn throw(&mut self, error: RemoteError) -> Result<IterResult, RemoteError>;
}

/// What a method call produced.
pub enum Outcome {
    /// Plain return value.
    Value(Value),
    /// Generator to be driven by the caller.
    Generator(Box<dyn Generator>),
}

impl Outcome {
    /// Wrap a generator.
    pub fn generator(generator: impl Generator + 'static) -> Self {
        Self::Generator(Box::new(generator))
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

/// A module that can be registered with a server or called locally.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Name and method set.
    fn descriptor(&self) -> &ModuleDescriptor;

    /// Call `method` with positional arguments.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Outcome, RemoteError>;

    /// Lifecycle hook run before the module is marked ready.
    async fn init(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    /// Lifecycle hook run after the module is marked not ready.
    async fn destroy(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

// ── Stream-backed generators ────────────────────────────────────────

/// Generator over a stream of values.
///
/// Inputs passed to `next` are ignored. When the stream ends the generator
/// finishes with its output value (`null` unless set).
pub struct StreamGenerator {
    stream: Option<BoxStream<'static, Result<Value, RemoteError>>>,
    output: Value,
}

impl StreamGenerator {
    /// Generator yielding the stream's items.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, RemoteError>> + Send + 'static,
    {
        Self {
            stream: Some(stream.boxed()),
            output: Value::Null,
        }
    }

    /// Value returned once the stream is exhausted.
    #[must_use]
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }
}

#[async_trait]
impl Generator for StreamGenerator {
    async fn next(&mut self, _input: Value) -> Result<IterResult, RemoteError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(IterResult::done(Value::Null));
        };
        match stream.next().await {
            Some(Ok(value)) => Ok(IterResult::yielded(value)),
            Some(Err(err)) => {
                self.stream = None;
                Err(err)
            }
            None => {
                self.stream = None;
                Ok(IterResult::done(std::mem::take(&mut self.output)))
            }
        }
    }

    async fn return_value(&mut self, value: Value) -> Result<IterResult, RemoteError> {
        self.stream = None;
        Ok(IterResult::done(value))
    }

    async fn throw(&mut self, error: RemoteError) -> Result<IterResult, RemoteError> {
        self.stream = None;
        Err(error)
    }
}

// ── Closure-backed modules ──────────────────────────────────────────

type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Outcome, RemoteError>> + Send + Sync>;
type Hook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), RemoteError>> + Send + Sync>;

/// Module assembled from closures.
pub struct FnModule {
    descriptor: ModuleDescriptor,
    handlers: HashMap<String, Handler>,
    on_init: Option<Hook>,
    on_destroy: Option<Hook>,
}

impl FnModule {
    /// Empty module named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(name, Vec::<String>::new()),
            handlers: HashMap::new(),
            on_init: None,
            on_destroy: None,
        }
    }

    /// Add a method returning a plain value.
    #[must_use]
    pub fn method<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args: Vec<Value>| -> BoxFuture<'static, Result<Outcome, RemoteError>> {
            let fut = handler(args);
            Box::pin(async move { fut.await.map(Outcome::Value) })
        });
        self.insert(name, handler);
        self
    }

    /// Add a method returning a generator.
    #[must_use]
    pub fn generator<F, G>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(Vec<Value>) -> G + Send + Sync + 'static,
        G: Generator + 'static,
    {
        let handler: Handler = Arc::new(move |args: Vec<Value>| -> BoxFuture<'static, Result<Outcome, RemoteError>> {
            let outcome = Outcome::generator(factory(args));
            Box::pin(async move { Ok(outcome) })
        });
        self.insert(name, handler);
        self
    }

    /// Run `hook` on init.
    #[must_use]
    pub fn on_init<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        self.on_init = Some(Arc::new(move || -> BoxFuture<'static, Result<(), RemoteError>> { Box::pin(hook()) }));
        self
    }

    /// Run `hook` on destroy.
    #[must_use]
    pub fn on_destroy<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        self.on_destroy = Some(Arc::new(move || -> BoxFuture<'static, Result<(), RemoteError>> { Box::pin(hook()) }));
        self
    }

    fn insert(&mut self, name: &str, handler: Handler) {
        self.descriptor = self.descriptor.clone().with_method(name);
        let _ = self.handlers.insert(name.to_owned(), handler);
    }
}

#[async_trait]
impl Module for FnModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Outcome, RemoteError> {
        let handler = self.handlers.get(method).cloned().ok_or_else(|| {
            RemoteError::type_error(format!("{}.{method} is not a function", self.descriptor.name()))
        })?;
        handler(args).await
    }

    async fn init(&self) -> Result<(), RemoteError> {
        match &self.on_init {
            Some(hook) => hook().await,
            None => Ok(()),
        }
    }

    async fn destroy(&self) -> Result<(), RemoteError> {
        match &self.on_destroy {
            Some(hook) => hook().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for FnModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnModule")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn math() -> FnModule {
        FnModule::new("math").method("add", |args| async move {
            let a = args.first().and_then(Value::as_i64).unwrap_or_default();
            let b = args.get(1).and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(a + b))
        })
    }

    #[test]
    fn descriptor_tracks_methods() {
        let desc = ModuleDescriptor::new("detail", ["getOrgs", "getName"]);
        assert!(desc.has_method("getOrgs"));
        assert!(!desc.has_method("setName"));
        assert_eq!(desc.methods().collect::<Vec<_>>(), vec!["getName", "getOrgs"]);
    }

    #[tokio::test]
    async fn fn_module_calls_handler() {
        let module = math();
        assert!(module.descriptor().has_method("add"));
        let outcome = module.call("add", vec![json!(2), json!(3)]).await.unwrap();
        assert!(matches!(outcome, Outcome::Value(v) if v == json!(5)));
    }

    #[tokio::test]
    async fn fn_module_rejects_unknown_method() {
        let err = math().call("pow", vec![]).await.unwrap_err();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "math.pow is not a function");
    }

    #[tokio::test]
    async fn stream_generator_yields_then_finishes() {
        let items = futures::stream::iter(vec![Ok(json!("a")), Ok(json!("b"))]);
        let mut g = StreamGenerator::new(items).with_output(json!("end"));
        assert_eq!(g.next(Value::Null).await.unwrap(), IterResult::yielded(json!("a")));
        assert_eq!(g.next(Value::Null).await.unwrap(), IterResult::yielded(json!("b")));
        assert_eq!(g.next(Value::Null).await.unwrap(), IterResult::done(json!("end")));
        assert_eq!(g.next(Value::Null).await.unwrap(), IterResult::done(Value::Null));
    }

    #[tokio::test]
    async fn stream_generator_return_and_throw_close_it() {
        let mut g = StreamGenerator::new(futures::stream::iter(vec![Ok(json!(1))]));
        assert_eq!(g.return_value(json!("early")).await.unwrap(), IterResult::done(json!("early")));
        assert!(g.next(Value::Null).await.unwrap().done);

        let mut g = StreamGenerator::new(futures::stream::iter(vec![Ok(json!(1))]));
        let err = g.throw(RemoteError::error("stop")).await.unwrap_err();
        assert_eq!(err.message, "stop");
        assert!(g.next(Value::Null).await.unwrap().done);
    }

    #[tokio::test]
    async fn lifecycle_hooks_run() {
        let module = math()
            .on_init(|| async { Ok(()) })
            .on_destroy(|| async { Err(RemoteError::error("teardown failed")) });
        assert!(module.init().await.is_ok());
        assert_eq!(module.destroy().await.unwrap_err().message, "teardown failed");
    }
}
