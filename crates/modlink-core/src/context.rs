//! Application context shared by the endpoints of one process.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::call::{Call, CallRequest};
use crate::errors::ChannelError;
use crate::local::invoke_entry;
use crate::module::Module;
use crate::registry::{ModuleRegistry, RegistryEntry, init_module};
use crate::routing::RoutingTable;
use crate::sink::ErrorSink;

/// Registry, routing table and the id of the server running in this process.
#[derive(Debug, Default)]
pub struct AppContext {
    registry: ModuleRegistry,
    routing: RoutingTable,
    local_server: RwLock<Option<String>>,
    sink: ErrorSink,
}

impl AppContext {
    /// Empty context, ready to share between endpoints.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Local modules.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Providers per module.
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Sink for lifecycle errors of modules registered through the context.
    pub fn sink(&self) -> &ErrorSink {
        &self.sink
    }

    /// Id of the server endpoint attached to this process, if any.
    pub fn local_server_id(&self) -> Option<String> {
        self.local_server.read().clone()
    }

    /// Record `id` as the in-process server.
    pub fn attach_server(&self, id: &str) {
        debug!(server_id = id, "attaching local server");
        *self.local_server.write() = Some(id.to_owned());
    }

    /// Forget the in-process server if it is `id`.
    pub fn detach_server(&self, id: &str) {
        let mut local = self.local_server.write();
        if local.as_deref() == Some(id) {
            *local = None;
        }
    }

    /// Whether `id` names the in-process server.
    pub fn is_local_server(&self, id: &str) -> bool {
        self.local_server.read().as_deref() == Some(id)
    }

    /// Register a module for local calls only and run its `init` hook.
    pub async fn register_local(&self, module: Arc<dyn Module>) -> Arc<RegistryEntry> {
        let entry = self.registry.insert(module);
        init_module(&entry, &self.sink).await;
        entry
    }

    /// Call `module.method(args)` on whichever provider routing picks, or on
    /// the local registry when the module has no providers.
    #[track_caller]
    pub fn call(&self, module: &str, method: &str, args: Vec<Value>) -> Call {
        self.dispatch(CallRequest::new(module, method, args))
    }

    /// Dispatch a prepared request.
    pub fn dispatch(&self, request: CallRequest) -> Call {
        if self.routing.has_route(&request.module) {
            return match self.routing.select(&request.module, request.route_key()) {
                Ok(provider) => provider.invoke(request),
                Err(err) => Call::failed(err),
            };
        }
        self.call_local(request, false)
    }

    /// Call the local registry instance directly.
    pub fn call_local(&self, request: CallRequest, check_ready: bool) -> Call {
        match self.registry.get(&request.module) {
            Some(entry) => invoke_entry(&entry, request, check_ready),
            None => Call::failed(ChannelError::not_a_function(&request.module, &request.method)),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Invocation;
    use crate::errors::Result;
    use crate::module::FnModule;
    use crate::routing::{CallTarget, Provider};
    use crate::task::Operation;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn math() -> Arc<dyn Module> {
        Arc::new(FnModule::new("math").method("add", |args| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        }))
    }

    struct Fixed(Value);

    #[async_trait]
    impl Invocation for Fixed {
        async fn apply(&mut self, _op: Operation) -> Result<Value> {
            Ok(self.0.clone())
        }
    }

    struct Answer(&'static str);

    impl CallTarget for Answer {
        fn invoke(&self, _request: CallRequest) -> Call {
            Call::new(Fixed(json!(self.0)))
        }
    }

    #[tokio::test]
    async fn unrouted_module_runs_locally() {
        let ctx = AppContext::new();
        let _ = ctx.register_local(math()).await;
        let sum = ctx.call("math", "add", vec![json!(2), json!(3)]).await.unwrap();
        assert_eq!(sum, json!(5));
    }

    #[tokio::test]
    async fn unknown_module_is_not_a_function() {
        let ctx = AppContext::new();
        let err = ctx.call("nope", "run", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "nope.run is not a function");
    }

    #[tokio::test]
    async fn routed_module_skips_not_ready_provider() {
        let ctx = AppContext::new();
        let _ = ctx.register_local(math()).await;
        ctx.routing().insert(
            "math",
            Provider::new("second", Arc::new(Answer("second")), Arc::new(AtomicBool::new(false))),
        );
        ctx.routing().insert(
            "math",
            Provider::new("first", Arc::new(Answer("first")), Arc::new(AtomicBool::new(true))),
        );
        for n in 0..8 {
            let picked = ctx.call("math", "add", vec![json!(n)]).await.unwrap();
            assert_eq!(picked, json!("first"));
        }
    }

    #[tokio::test]
    async fn routed_module_without_ready_provider_is_unavailable() {
        let ctx = AppContext::new();
        ctx.routing().insert(
            "user",
            Provider::new("s1", Arc::new(Answer("s1")), Arc::new(AtomicBool::new(false))),
        );
        let err = ctx.call("user", "get", vec![json!(1)]).await.unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable { .. }));
    }

    #[test]
    fn local_server_attachment() {
        let ctx = AppContext::new();
        ctx.attach_server("ws://127.0.0.1:9000/");
        assert!(ctx.is_local_server("ws://127.0.0.1:9000/"));
        ctx.detach_server("ws://other:1/");
        assert_eq!(ctx.local_server_id().as_deref(), Some("ws://127.0.0.1:9000/"));
        ctx.detach_server("ws://127.0.0.1:9000/");
        assert!(ctx.local_server_id().is_none());
    }
}
