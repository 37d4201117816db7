//! Client endpoint.
//!
//! An [`RpcClient`] keeps one socket to a server, re-establishing it after
//! the server restarts. Remote modules are registered by descriptor and
//! published into the shared [`AppContext`] routing table under the server's
//! id, so `ctx.call(..)` can reach them like local modules.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use metrics::counter;
use modlink_core::errors::humanize_duration;
use modlink_core::{
    Address, AppContext, Call, CallRequest, CallTarget, ChannelError, Codec, ErrorSink, Event, ModuleDescriptor,
    Provider, RemoteError, Request, Response, Result, Target,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::connection::{self, FrameSink, FrameStream, Greeting, Inbound, Socket};
use crate::keepalive::{KeepaliveResult, run_keepalive};
use crate::remote::RemoteTarget;
use crate::tasks::{Reply, TaskTable};
use crate::topics::{self, SubscriptionId, TopicHandler, Topics};

/// How long `close` waits for the writer to flush the close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Created, never opened.
    Initiated,
    /// Handshake in progress.
    Connecting,
    /// Socket open and greeted.
    Connected,
    /// Socket lost; reconnecting.
    Disconnected,
    /// Closed for good.
    Closed,
}

impl ClientState {
    /// Lower-case label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound path: the live writer queue, or requests held back while no
/// socket is up.
#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<Request>>,
    backlog: VecDeque<Request>,
}

/// Tasks serving one socket.
struct Session {
    generation: u64,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
    keepalive: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
}

impl Session {
    /// Stop reading and pinging. The writer is left to the caller.
    fn stop(&self) {
        self.cancel.cancel();
        if let Some(reader) = &self.reader {
            reader.abort();
        }
        self.keepalive.abort();
    }
}

/// State shared by the client handle, its socket tasks and its call handles.
pub(crate) struct ClientInner {
    pub(crate) ctx: Arc<AppContext>,
    pub(crate) config: ClientConfig,
    pub(crate) tasks: TaskTable,
    address: Address,
    id: String,
    sink: ErrorSink,
    state: watch::Sender<ClientState>,
    server_id: RwLock<String>,
    link: Mutex<Link>,
    modules: Mutex<BTreeMap<String, ModuleDescriptor>>,
    ready: Arc<AtomicBool>,
    topics: Topics,
    generation: AtomicU64,
    session: Mutex<Option<Session>>,
    closing: CancellationToken,
}

impl ClientInner {
    pub(crate) fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub(crate) fn server_id(&self) -> String {
        self.server_id.read().clone()
    }

    /// Queue a frame, holding it back while no socket is up.
    pub(crate) fn send(&self, request: Request) -> Result<()> {
        if self.state() == ClientState::Closed {
            return Err(ChannelError::Transport(format!(
                "channel to {} is closed",
                self.server_id()
            )));
        }
        let mut link = self.link.lock();
        let request = match &link.outbound {
            Some(tx) => match tx.send(request) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(request)) => request,
            },
            None => request,
        };
        link.backlog.push_back(request);
        Ok(())
    }

    /// Queue a frame only if a socket is up.
    fn send_now(&self, request: Request) -> bool {
        self.link
            .lock()
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.send(request).is_ok())
    }

    /// Move to `Connecting` from `Initiated` or `Disconnected`. Returns the
    /// state to restore if the attempt fails.
    fn begin_connecting(&self) -> Result<ClientState> {
        let mut previous = ClientState::Initiated;
        let mut refused = None;
        let _ = self.state.send_if_modified(|state| match *state {
            ClientState::Initiated | ClientState::Disconnected => {
                previous = *state;
                *state = ClientState::Connecting;
                true
            }
            other => {
                refused = Some(other);
                false
            }
        });
        match refused {
            None => Ok(previous),
            Some(ClientState::Closed) => Err(ChannelError::InvalidState(format!(
                "cannot reopen the channel to {} after closing it",
                self.address
            ))),
            Some(state) => Err(ChannelError::InvalidState(format!(
                "channel to {} is already {state}",
                self.address
            ))),
        }
    }

    /// Change state unless the client has been closed.
    fn set_state(&self, next: ClientState) {
        let _ = self.state.send_if_modified(|state| {
            if *state == ClientState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn restore_state(&self, previous: ClientState) {
        let _ = self.state.send_if_modified(|state| {
            if *state != ClientState::Connecting {
                return false;
            }
            *state = previous;
            true
        });
    }

    /// One connection attempt: dial, greet, install.
    async fn connect_once(self: &Arc<Self>) -> Result<()> {
        let previous = self.begin_connecting()?;
        debug!(dsn = %self.address, "connecting");
        let timeout = self.config.timeout();
        let dial = connection::dial(&self.address, &self.id, &self.config.tls);
        let attempt = match time::timeout(timeout, dial).await {
            Ok(attempt) => attempt,
            Err(_) => Err(ChannelError::Handshake {
                status: None,
                message: format!(
                    "handshake with {} timed out after {}",
                    self.address,
                    humanize_duration(timeout)
                ),
            }),
        };
        match attempt {
            Ok((socket, greeting)) => self.install(socket, greeting),
            Err(err) => {
                self.restore_state(previous);
                Err(err)
            }
        }
    }

    /// Take over a greeted socket: adopt the server id and codec, start the
    /// socket tasks and flush held-back frames.
    fn install(self: &Arc<Self>, socket: Socket, greeting: Greeting) -> Result<()> {
        if self.closing.is_cancelled() {
            return Err(ChannelError::InvalidState(format!(
                "channel to {} closed during the handshake",
                self.address
            )));
        }
        let Socket { sink, stream } = socket;
        let Greeting { server_id, codec } = greeting;
        self.adopt_server_id(&server_id);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.closing.child_token();
        let pong = Arc::new(Notify::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, rx, codec, self.sink.clone()));
        let keepalive = tokio::spawn(keepalive_loop(
            Arc::downgrade(self),
            generation,
            Arc::clone(&pong),
            cancel.clone(),
        ));
        *self.session.lock() = Some(Session {
            generation,
            cancel: cancel.clone(),
            writer,
            keepalive,
            reader: None,
        });

        let flushed = {
            let mut link = self.link.lock();
            let flushed = link.backlog.len();
            for request in link.backlog.drain(..) {
                let _ = tx.send(request);
            }
            link.outbound = Some(tx);
            flushed
        };
        self.ready.store(true, Ordering::SeqCst);
        self.set_state(ClientState::Connected);

        let reader = tokio::spawn(read_loop(Arc::clone(self), stream, codec, generation, pong, cancel));
        if let Some(session) = self.session.lock().as_mut().filter(|s| s.generation == generation) {
            session.reader = Some(reader);
        }

        if self.closing.is_cancelled() {
            // Closed while installing; undo.
            if let Some(session) = self.shutdown() {
                session.writer.abort();
            }
            return Err(ChannelError::InvalidState(format!(
                "channel to {} closed during the handshake",
                self.address
            )));
        }

        counter!("rpc_client_connections_total").increment(1);
        info!(server_id = %server_id, %codec, flushed, "connected");
        Ok(())
    }

    /// Re-key this client's routes when the server id changes.
    fn adopt_server_id(&self, server_id: &str) {
        let old = std::mem::replace(&mut *self.server_id.write(), server_id.to_owned());
        if old == server_id {
            return;
        }
        debug!(old = %old, new = server_id, "server id changed");
        for name in self.modules.lock().keys() {
            self.ctx.routing().rename(name, &old, server_id);
        }
    }

    /// Tear down the socket of `generation` and start reconnecting.
    fn connection_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let session = {
            let mut session = self.session.lock();
            match session.as_ref() {
                Some(current) if current.generation == generation => session.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };
        session.stop();
        session.writer.abort();

        let held: HashSet<u64> = {
            let mut link = self.link.lock();
            link.outbound = None;
            link.backlog.iter().map(|r| r.task_id).collect()
        };
        self.ready.store(false, Ordering::SeqCst);
        let server_id = self.server_id();
        let failed = self.tasks.fail_all(
            &ChannelError::Transport(format!("connection to {server_id} lost: {reason}")),
            &held,
        );
        counter!("rpc_client_disconnections_total").increment(1);

        if self.state() == ClientState::Closed {
            return;
        }
        warn!(server_id = %server_id, reason, failed_tasks = failed, "connection lost");
        self.set_state(ClientState::Disconnected);
        let inner = Arc::clone(self);
        drop(tokio::spawn(async move { inner.reconnect_loop().await }));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let delay = self.config.reconnect_delay();
        loop {
            tokio::select! {
                () = time::sleep(delay) => {}
                () = self.closing.cancelled() => return,
            }
            match self.connect_once().await {
                Ok(()) => {
                    info!(dsn = %self.address, "reconnected");
                    return;
                }
                // Closed, or someone else got there first.
                Err(ChannelError::InvalidState(_)) => return,
                Err(err) => debug!(error = %err, "reconnect attempt failed"),
            }
        }
    }

    /// Mark the client closed, stop its socket tasks and fail everything
    /// outstanding. Returns the session whose writer still has to drain.
    fn shutdown(&self) -> Option<Session> {
        let _ = self.state.send_replace(ClientState::Closed);
        self.closing.cancel();
        self.ready.store(false, Ordering::SeqCst);
        let session = self.session.lock().take();
        if let Some(session) = &session {
            session.stop();
        }
        {
            let mut link = self.link.lock();
            link.outbound = None;
            link.backlog.clear();
        }
        let server_id = self.server_id();
        let _ = self.tasks.fail_all(
            &ChannelError::Transport(format!("channel to {server_id} closed")),
            &HashSet::new(),
        );
        for name in self.modules.lock().keys() {
            let _ = self.ctx.routing().remove(name, &server_id);
        }
        session
    }

    fn handle_frame(&self, frame: Response, pong: &Notify, publications: &mpsc::UnboundedSender<(String, Value)>) {
        match frame.event {
            Event::Invoke | Event::Return | Event::Throw | Event::Yield => {
                let Some(task_id) = frame.task_id() else {
                    self.sink.report(&ChannelError::Protocol(format!(
                        "{} frame without a task id from {}",
                        frame.event,
                        self.server_id()
                    )));
                    return;
                };
                let reply = Reply {
                    event: frame.event,
                    data: frame.data,
                };
                if !self.tasks.resolve(task_id, reply) {
                    debug!(task_id, "answer for a task nobody waits on");
                }
            }
            Event::Publish => {
                if let Target::Name(topic) = frame.target {
                    let _ = publications.send((topic, frame.data.unwrap_or(Value::Null)));
                }
            }
            Event::Pong => pong.notify_one(),
            Event::Connect | Event::Ping => self.sink.report(&ChannelError::Protocol(format!(
                "unexpected {} frame from {}",
                frame.event,
                self.server_id()
            ))),
        }
    }
}

async fn write_loop(mut sink: FrameSink, mut rx: mpsc::UnboundedReceiver<Request>, codec: Codec, errors: ErrorSink) {
    while let Some(request) = rx.recv().await {
        let message = match connection::request_message(codec, &request) {
            Ok(message) => message,
            Err(err) => {
                errors.report(&err);
                continue;
            }
        };
        if let Err(err) = sink.send(message).await {
            debug!(error = %err, "socket write failed");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

#[instrument(skip_all, fields(dsn = %inner.address, generation = generation))]
async fn read_loop(
    inner: Arc<ClientInner>,
    mut stream: FrameStream,
    codec: Codec,
    generation: u64,
    pong: Arc<Notify>,
    cancel: CancellationToken,
) {
    let (publications, mut pending) = mpsc::unbounded_channel::<(String, Value)>();
    let delivery = {
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some((topic, payload)) = pending.recv().await {
                let handlers = inner.topics.handlers(&topic);
                topics::deliver(handlers, &topic, payload, &inner.sink).await;
            }
        })
    };

    let reason = loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return,
            message = stream.next() => message,
        };
        let payload = match message {
            Some(Ok(Message::Pong(_))) => {
                pong.notify_one();
                continue;
            }
            Some(Ok(message)) => match connection::classify(message) {
                Inbound::Data(payload) => payload,
                Inbound::Control => continue,
                Inbound::Closed => break "closed by the server".to_owned(),
            },
            Some(Err(err)) => break err.to_string(),
            None => break "socket ended".to_owned(),
        };
        match codec.decode::<Response>(&payload) {
            Ok(frame) => inner.handle_frame(frame, &pong, &publications),
            Err(err) => inner.sink.report(&ChannelError::Protocol(format!(
                "malformed frame from {}: {err}",
                inner.server_id()
            ))),
        }
    };
    drop(publications);
    drop(delivery);
    inner.connection_lost(generation, &reason);
}

async fn keepalive_loop(inner: Weak<ClientInner>, generation: u64, pong: Arc<Notify>, cancel: CancellationToken) {
    let Some((interval, timeout)) = inner
        .upgrade()
        .map(|client| (client.config.ping_interval(), client.config.ping_timeout()))
    else {
        return;
    };
    let pinger = inner.clone();
    let result = run_keepalive(
        move |timestamp| {
            pinger
                .upgrade()
                .is_some_and(|client| client.send_now(Request::ping(timestamp)))
        },
        pong,
        interval,
        timeout,
        cancel,
    )
    .await;
    if result == KeepaliveResult::TimedOut {
        if let Some(client) = inner.upgrade() {
            client.connection_lost(generation, "keepalive timed out");
        }
    }
}

/// Client endpoint of an RPC channel.
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Client for `address`. The `id` address parameter, if present,
    /// overrides `config.id`.
    pub fn new(address: Address, ctx: Arc<AppContext>, config: ClientConfig) -> Self {
        let id = address.id().map_or_else(|| config.id.clone(), str::to_owned);
        let (state, _) = watch::channel(ClientState::Initiated);
        let server_id = address.dsn();
        Self {
            inner: Arc::new(ClientInner {
                ctx,
                config,
                tasks: TaskTable::new(),
                address,
                id,
                sink: ErrorSink::new(),
                state,
                server_id: RwLock::new(server_id),
                link: Mutex::new(Link::default()),
                modules: Mutex::new(BTreeMap::new()),
                ready: Arc::new(AtomicBool::new(false)),
                topics: Topics::new(),
                generation: AtomicU64::new(0),
                session: Mutex::new(None),
                closing: CancellationToken::new(),
            }),
        }
    }

    /// Connect and wait for the server's greeting.
    ///
    /// Fails when the client is already connecting or connected, or after
    /// [`close`](Self::close).
    pub async fn open(&self) -> Result<()> {
        self.inner.connect_once().await
    }

    /// Close the socket for good. Outstanding calls fail, the client's routes
    /// are withdrawn and reconnection stops.
    pub async fn close(&self) {
        if self.inner.state() == ClientState::Closed {
            return;
        }
        let session = self.inner.shutdown();
        if let Some(session) = session {
            let mut writer = session.writer;
            if time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        info!(dsn = %self.inner.address, "channel closed");
    }

    /// Expose the remote module `descriptor` through the routing table.
    /// Registering the same name again replaces the descriptor.
    pub fn register(&self, descriptor: ModuleDescriptor) {
        let name = descriptor.name().to_owned();
        let target: Arc<dyn CallTarget> = Arc::new(RemoteTarget::new(Arc::downgrade(&self.inner), descriptor.clone()));
        self.inner.ctx.routing().insert(
            &name,
            Provider::new(self.inner.server_id(), target, Arc::clone(&self.inner.ready)),
        );
        debug!(module = %name, "remote module registered");
        let _ = self.inner.modules.lock().insert(name, descriptor);
    }

    /// Withdraw a remote module.
    pub fn deregister(&self, name: &str) -> bool {
        if self.inner.modules.lock().remove(name).is_none() {
            return false;
        }
        let _ = self.inner.ctx.routing().remove(name, &self.inner.server_id());
        true
    }

    /// Names of the registered remote modules, sorted.
    pub fn modules(&self) -> Vec<String> {
        self.inner.modules.lock().keys().cloned().collect()
    }

    /// Call `module.method(args)` on this client's server, bypassing routing.
    ///
    /// Calls made while the client reconnects are sent once the next
    /// handshake completes.
    #[track_caller]
    pub fn call(&self, module: &str, method: &str, args: Vec<Value>) -> Call {
        let request = CallRequest::new(module, method, args);
        let descriptor = self.inner.modules.lock().get(module).cloned();
        match descriptor {
            Some(descriptor) => RemoteTarget::new(Arc::downgrade(&self.inner), descriptor).invoke(request),
            None => Call::failed(ChannelError::not_a_function(module, method)),
        }
    }

    /// Run `handler` for every payload published on `topic`.
    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), RemoteError>> + Send + 'static,
    {
        let handler: TopicHandler = Arc::new(move |payload: Value| handler(payload).boxed());
        self.inner.topics.subscribe(topic, handler)
    }

    /// Remove one subscription, or all of `topic` when `id` is `None`.
    pub fn unsubscribe(&self, topic: &str, id: Option<SubscriptionId>) -> bool {
        self.inner.topics.unsubscribe(topic, id)
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Whether the socket is up.
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Whether a handshake is in progress.
    pub fn is_connecting(&self) -> bool {
        self.state() == ClientState::Connecting
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state() == ClientState::Closed
    }

    /// Id sent in the handshake.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Id of the server: the address dsn until the first greeting.
    pub fn server_id(&self) -> String {
        self.inner.server_id()
    }

    /// Canonical address string.
    pub fn dsn(&self) -> String {
        self.inner.address.dsn()
    }

    /// Address the client dials.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Calls waiting for an answer.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Replace the handler for errors outside any call.
    pub fn on_error(&self, handler: impl Fn(&ChannelError) + Send + Sync + 'static) {
        self.inner.sink.set(handler);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if self.inner.state() != ClientState::Closed {
            if let Some(session) = self.inner.shutdown() {
                session.writer.abort();
            }
        }
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("id", &self.inner.id)
            .field("dsn", &self.dsn())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
