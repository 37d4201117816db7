//! `RpcServer`: serves the modules of one process over WebSocket.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Router;
use axum::serve::Listener;
use modlink_core::registry::{destroy_module, init_module};
use modlink_core::{
    Address, AppContext, ChannelError, ErrorSink, Module, Protocol, Provider, RegistryEntry, Result,
};
use modlink_core::local::LocalTarget;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::PeerSet;
use crate::config::ServerConfig;
use crate::handshake::upgrade_handler;
use crate::shutdown::ShutdownCoordinator;
use crate::tls::TlsListener;

/// State shared with the Axum handlers and peer sessions.
pub struct ServerShared {
    ctx: Arc<AppContext>,
    config: ServerConfig,
    id: RwLock<String>,
    address: RwLock<Address>,
    shutdown: RwLock<Arc<ShutdownCoordinator>>,
    /// Connected peers.
    pub peers: PeerSet,
    /// Sink for errors outside any call.
    pub sink: ErrorSink,
}

impl ServerShared {
    /// Current server id.
    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    /// Current address.
    pub fn address(&self) -> Address {
        self.address.read().clone()
    }

    /// App context the server resolves modules from.
    pub fn ctx(&self) -> &AppContext {
        &self.ctx
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Token cancelled when the current listener shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.read().token()
    }
}

/// The RPC server endpoint.
pub struct RpcServer {
    shared: Arc<ServerShared>,
    serve: Mutex<Option<JoinHandle<()>>>,
    modules: Mutex<BTreeSet<String>>,
}

impl RpcServer {
    /// Create a server for `address`. The id is `config.id`, else the
    /// address `id` parameter, else the address DSN.
    pub fn new(address: Address, ctx: Arc<AppContext>, config: ServerConfig) -> Self {
        let id = config
            .id
            .clone()
            .or_else(|| address.id().map(str::to_owned))
            .unwrap_or_else(|| address.dsn());
        Self {
            shared: Arc::new(ServerShared {
                ctx,
                config,
                id: RwLock::new(id),
                address: RwLock::new(address),
                shutdown: RwLock::new(Arc::new(ShutdownCoordinator::new())),
                peers: PeerSet::new(),
                sink: ErrorSink::new(),
            }),
            serve: Mutex::new(None),
            modules: Mutex::new(BTreeSet::new()),
        }
    }

    /// Server id, used as provider key in the routing table.
    pub fn id(&self) -> String {
        self.shared.id()
    }

    /// Current address. The port is updated after binding port 0.
    pub fn address(&self) -> Address {
        self.shared.address()
    }

    /// Canonical address string.
    pub fn dsn(&self) -> String {
        self.shared.address().dsn()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// App context shared with the server.
    pub fn ctx(&self) -> &Arc<AppContext> {
        &self.shared.ctx
    }

    /// Whether a listener is running.
    pub fn is_open(&self) -> bool {
        self.serve.lock().is_some()
    }

    /// Replace the error sink handler.
    pub fn on_error(&self, handler: impl Fn(&ChannelError) + Send + Sync + 'static) {
        self.shared.sink.set(handler);
    }

    /// Build the Axum router. Useful for embedding the endpoint in an
    /// existing server; [`RpcServer::open`] serves the same router.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(upgrade_handler)
            .with_state(Arc::clone(&self.shared))
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Bind the configured address and start accepting peers.
    pub async fn open(&self) -> Result<()> {
        self.ensure_closed()?;
        let address = self.address();
        match address.protocol() {
            Protocol::Ws | Protocol::Wss => {
                let listener = TcpListener::bind((address.host(), address.port())).await?;
                self.open_with_listener(listener).await
            }
            Protocol::WsUnix => self.open_unix(&address).await,
        }
    }

    /// Serve on a listener bound by the caller. On a `wss:` address TLS is
    /// terminated with `config.tls`.
    pub async fn open_with_listener(&self, listener: TcpListener) -> Result<()> {
        self.ensure_closed()?;
        let port = listener.local_addr()?.port();
        let handle = if self.address().protocol() == Protocol::Wss {
            let config = self.shared.config.tls.server_config()?;
            self.spawn_serve(TlsListener::new(listener, config)?)
        } else {
            self.spawn_serve(listener)
        };
        self.adopt_port(port);
        self.started(handle).await;
        Ok(())
    }

    #[cfg(unix)]
    async fn open_unix(&self, address: &Address) -> Result<()> {
        let path = address
            .socket_path()
            .ok_or_else(|| ChannelError::InvalidAddress(address.dsn()))?
            .to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_file(&path).await?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        let handle = self.spawn_serve(listener);
        self.started(handle).await;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn open_unix(&self, _address: &Address) -> Result<()> {
        Err(ChannelError::InvalidAddress(
            "unix domain sockets are not supported on this platform".into(),
        ))
    }

    /// Stop accepting peers, force-return suspended generators, drop every
    /// connection, destroy the registered modules and detach from routing.
    pub async fn close(&self) {
        let Some(serve) = self.serve.lock().take() else {
            return;
        };
        let timeout = self.shared.config.shutdown_timeout();

        let returned = match tokio::time::timeout(timeout, self.shared.peers.force_return_all()).await {
            Ok(count) => count,
            Err(_) => {
                warn!("timed out returning suspended tasks");
                0
            }
        };
        let dropped = self.shared.peers.close_all().await;

        let coordinator = Arc::clone(&*self.shared.shutdown.read());
        coordinator.graceful_shutdown(vec![serve], timeout).await;

        let id = self.id();
        let names: Vec<String> = self.modules.lock().iter().cloned().collect();
        for name in &names {
            let _ = self.shared.ctx.routing().remove(name, &id);
            if let Some(entry) = self.shared.ctx.registry().get(name) {
                destroy_module(&entry, &self.shared.sink).await;
            }
        }
        let _ = self.shared.ctx.routing().remove_key(&id);
        self.shared.ctx.detach_server(&id);

        if let Some(path) = self.address().socket_path() {
            let _ = tokio::fs::remove_file(path).await;
        }
        info!(id, returned, dropped, "rpc server closed");
    }

    // ── Modules ─────────────────────────────────────────────────────

    /// Register `module` in the app context, publish it under the server id
    /// and run its `init` hook.
    pub async fn register(&self, module: Arc<dyn Module>) -> Arc<RegistryEntry> {
        let registry = self.shared.ctx.registry();
        let name = module.descriptor().name().to_owned();

        let entry = match registry.get(&name) {
            Some(existing) if Arc::ptr_eq(existing.module(), &module) => existing,
            Some(existing) => {
                destroy_module(&existing, &self.shared.sink).await;
                registry.insert(module)
            }
            None => registry.insert(module),
        };

        let _ = self.modules.lock().insert(name);
        self.publish_route(&entry);
        init_module(&entry, &self.shared.sink).await;
        entry
    }

    /// Remove `name` from the server and run its `destroy` hook.
    pub async fn deregister(&self, name: &str) -> bool {
        if !self.modules.lock().remove(name) {
            return false;
        }
        let _ = self.shared.ctx.routing().remove(name, &self.id());
        if let Some(entry) = self.shared.ctx.registry().remove(name) {
            destroy_module(&entry, &self.shared.sink).await;
        }
        true
    }

    /// Names of the modules registered through this server.
    pub fn modules(&self) -> Vec<String> {
        self.modules.lock().iter().cloned().collect()
    }

    // ── Peers ───────────────────────────────────────────────────────

    /// Send `[PUBLISH, topic, data]` to all peers, or to `peer_ids` only.
    /// Returns whether any peer was sent to.
    pub async fn publish(&self, topic: &str, data: Value, peer_ids: Option<&[String]>) -> bool {
        self.shared.peers.publish(topic, &data, peer_ids).await
    }

    /// Handshake ids of the connected peers.
    pub async fn clients(&self) -> Vec<String> {
        self.shared.peers.peer_ids().await
    }

    /// Suspended generator tasks across all peers.
    pub async fn suspended_tasks(&self) -> usize {
        self.shared.peers.suspended_tasks().await
    }

    // ── Internals ───────────────────────────────────────────────────

    fn ensure_closed(&self) -> Result<()> {
        if self.is_open() {
            return Err(ChannelError::InvalidState(format!("server {} is already open", self.id())));
        }
        Ok(())
    }

    fn spawn_serve<L>(&self, listener: L) -> JoinHandle<()>
    where
        L: Listener,
        L::Addr: std::fmt::Debug,
    {
        let token = self.fresh_coordinator().token();
        let router = self.router();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(err) = serve.await {
                warn!(error = %err, "listener stopped with error");
            }
        })
    }

    fn fresh_coordinator(&self) -> Arc<ShutdownCoordinator> {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        *self.shared.shutdown.write() = Arc::clone(&coordinator);
        coordinator
    }

    /// Record the bound port; an id derived from the DSN follows it.
    fn adopt_port(&self, port: u16) {
        let (old_dsn, new_dsn) = {
            let mut address = self.shared.address.write();
            if address.is_unix() || address.port() == port {
                return;
            }
            let old_dsn = address.dsn();
            *address = address.clone().with_port(port);
            (old_dsn, address.dsn())
        };

        let mut id = self.shared.id.write();
        if *id == old_dsn {
            for name in self.modules.lock().iter() {
                self.shared.ctx.routing().rename(name, &old_dsn, &new_dsn);
            }
            *id = new_dsn;
        }
    }

    fn publish_route(&self, entry: &Arc<RegistryEntry>) {
        let provider = Provider::new(
            self.id(),
            Arc::new(LocalTarget::new(Arc::clone(entry))),
            entry.ready_flag(),
        );
        self.shared.ctx.routing().insert(entry.name(), provider);
    }

    async fn started(&self, handle: JoinHandle<()>) {
        *self.serve.lock() = Some(handle);
        let id = self.id();
        self.shared.ctx.attach_server(&id);

        let names: Vec<String> = self.modules.lock().iter().cloned().collect();
        for name in names {
            if let Some(entry) = self.shared.ctx.registry().get(&name) {
                self.publish_route(&entry);
                init_module(&entry, &self.shared.sink).await;
            }
        }
        info!(id, dsn = %self.dsn(), "rpc server listening");
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
