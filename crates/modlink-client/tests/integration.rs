//! Client against a real server over loopback sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use modlink_client::{ClientConfig, ClientState, RpcClient};
use modlink_core::{
    Address, AppContext, ChannelError, Codec, FnModule, Generator, IterResult, ModuleDescriptor, RemoteError,
    StreamGenerator,
};
use modlink_server::{RpcServer, ServerConfig};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Generator counting how often it was returned.
struct Ticker {
    n: i64,
    returned: Arc<AtomicUsize>,
}

#[async_trait]
impl Generator for Ticker {
    async fn next(&mut self, _input: Value) -> Result<IterResult, RemoteError> {
        self.n += 1;
        Ok(IterResult::yielded(json!(self.n)))
    }

    async fn return_value(&mut self, value: Value) -> Result<IterResult, RemoteError> {
        let _ = self.returned.fetch_add(1, Ordering::SeqCst);
        Ok(IterResult::done(value))
    }

    async fn throw(&mut self, error: RemoteError) -> Result<IterResult, RemoteError> {
        Err(error)
    }
}

struct Fixture {
    server: Arc<RpcServer>,
    returned: Arc<AtomicUsize>,
}

impl Fixture {
    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/", self.server.address().port())
    }

    fn address(&self) -> Address {
        Address::parse(&self.url()).unwrap()
    }
}

async fn boot(address: Address, ctx: Arc<AppContext>) -> Fixture {
    let returned = Arc::new(AtomicUsize::new(0));
    let server = Arc::new(RpcServer::new(address, ctx, ServerConfig::default()));

    let math = FnModule::new("math").method("add", |args| async move {
        Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
    });
    let ticks = Arc::clone(&returned);
    let detail = FnModule::new("detail")
        .method("fail", |_| async { Err(RemoteError::type_error("bad input")) })
        .method("slow", |_| async {
            sleep(Duration::from_secs(2)).await;
            Ok(json!("late"))
        })
        .generator("getOrgs", |_| {
            StreamGenerator::new(futures::stream::iter(vec![Ok(json!("a")), Ok(json!("b"))])).with_output(json!("end"))
        })
        .generator("ticker", move |_| Ticker {
            n: 0,
            returned: Arc::clone(&ticks),
        });
    let _ = server.register(Arc::new(math)).await;
    let _ = server.register(Arc::new(detail)).await;
    server.open().await.unwrap();
    Fixture { server, returned }
}

async fn boot_default() -> Fixture {
    boot(Address::from_port(0, None), AppContext::new()).await
}

fn descriptors(client: &RpcClient) {
    client.register(ModuleDescriptor::new("math", ["add"]));
    client.register(ModuleDescriptor::new("detail", ["fail", "slow", "getOrgs", "ticker"]));
}

async fn connect(address: Address, config: ClientConfig) -> (RpcClient, Arc<AppContext>) {
    let ctx = AppContext::new();
    let client = RpcClient::new(address, Arc::clone(&ctx), config);
    descriptors(&client);
    timeout(TIMEOUT, client.open()).await.unwrap().unwrap();
    (client, ctx)
}

fn config(id: &str) -> ClientConfig {
    ClientConfig {
        id: id.into(),
        ..ClientConfig::default()
    }
}

async fn wait_for_state(client: &RpcClient, state: ClientState) {
    let mut rx = client.watch_state();
    let _ = timeout(TIMEOUT, rx.wait_for(|s| *s == state))
        .await
        .expect("state change timed out")
        .expect("client dropped");
}

// ── Connection ──────────────────────────────────────────────────────

#[tokio::test]
async fn open_adopts_server_id() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address(), config("c1")).await;
    assert!(client.is_connected());
    assert_eq!(client.server_id(), fx.server.id());
    assert_eq!(fx.server.clients().await, vec!["c1".to_owned()]);

    let err = client.open().await.unwrap_err();
    assert!(matches!(err, ChannelError::InvalidState(_)));
}

#[tokio::test]
async fn secret_is_checked() {
    let address = Address::from_port(0, None).with_secret("s3cret");
    let fx = boot(address, AppContext::new()).await;

    let client = RpcClient::new(fx.address(), AppContext::new(), config("c1"));
    let err = client.open().await.unwrap_err();
    assert!(matches!(err, ChannelError::Handshake { status: Some(401), .. }));
    assert_eq!(client.state(), ClientState::Initiated);

    let (client, _ctx) = connect(fx.address().with_secret("s3cret"), config("c2")).await;
    assert!(client.is_connected());
}

#[tokio::test]
async fn clone_codec_round_trips_calls() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address().with_codec(Codec::Clone), config("c1")).await;
    let value = client.call("math", "add", vec![json!(20), json!(22)]).await.unwrap();
    assert_eq!(value, json!(42));
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_calls() {
    let dir = tempfile::tempdir().unwrap();
    let location = format!("ws+unix:{}", dir.path().join("rpc.sock").display());
    let fx = boot(Address::parse(&location).unwrap(), AppContext::new()).await;

    let (client, _ctx) = connect(Address::parse(&location).unwrap(), config("c1")).await;
    assert_eq!(client.server_id(), fx.server.id());
    let value = client.call("math", "add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(value, json!(5));
}

#[tokio::test]
async fn keepalive_holds_an_idle_connection() {
    let fx = boot_default().await;
    let cfg = ClientConfig {
        ping_interval_ms: 30,
        ping_timeout_ms: 500,
        ..config("c1")
    };
    let (client, _ctx) = connect(fx.address(), cfg).await;
    sleep(Duration::from_millis(200)).await;
    assert!(client.is_connected());
    assert_eq!(fx.server.clients().await.len(), 1);
}

// ── Calls ───────────────────────────────────────────────────────────

#[tokio::test]
async fn direct_and_routed_calls() {
    let fx = boot_default().await;
    let (client, ctx) = connect(fx.address(), config("c1")).await;

    let direct = client.call("math", "add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(direct, json!(5));

    let routed = ctx.call("math", "add", vec![json!(1), json!(2), json!(3)]).await.unwrap();
    assert_eq!(routed, json!(6));
    assert_eq!(client.pending_tasks(), 0);
}

#[tokio::test]
async fn remote_error_keeps_name_and_message() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address(), config("c1")).await;

    let err = client.call("detail", "fail", vec![]).await.unwrap_err();
    let remote = match err {
        ChannelError::Remote(remote) => remote,
        other => panic!("expected a remote error, got {other:?}"),
    };
    assert_eq!(remote.name, "TypeError");
    assert_eq!(remote.message, "bad input");
    assert!(remote.stack.unwrap().contains("integration.rs"));
}

#[tokio::test]
async fn unknown_method_fails_locally() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address(), config("c1")).await;
    let err = client.call("math", "mul", vec![]).await.unwrap_err();
    assert_eq!(err.to_string(), "math.mul is not a function");
}

#[tokio::test]
async fn slow_call_times_out() {
    let fx = boot_default().await;
    let cfg = ClientConfig {
        timeout_ms: 1_000,
        ..config("c1")
    };
    let (client, _ctx) = connect(fx.address(), cfg).await;

    let err = client.call("detail", "slow", vec![]).await.unwrap_err();
    assert_eq!(err.to_string(), "detail.slow() timeout after 1 second");
    assert_eq!(client.pending_tasks(), 0);
}

#[tokio::test]
async fn generator_steps_in_order() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address(), config("c1")).await;

    let mut orgs = client.call("detail", "getOrgs", vec![]);
    let mut add = client.call("math", "add", vec![json!(1), json!(1)]);
    assert_eq!(orgs.next(Value::Null).await.unwrap(), IterResult::yielded(json!("a")));
    assert_eq!(add.result().await.unwrap(), json!(2));
    assert_eq!(orgs.next(Value::Null).await.unwrap(), IterResult::yielded(json!("b")));
    assert_eq!(orgs.next(Value::Null).await.unwrap(), IterResult::done(json!("end")));
    // Finished generators answer like closed calls.
    assert_eq!(orgs.next(Value::Null).await.unwrap(), IterResult::done(Value::Null));
}

#[tokio::test]
async fn stepping_a_plain_call_is_a_reference_error() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address(), config("c1")).await;

    let mut call = client.call("math", "add", vec![json!(1)]);
    let err = call.next(Value::Null).await.unwrap_err();
    let remote = match err {
        ChannelError::Remote(remote) => remote,
        other => panic!("expected a remote error, got {other:?}"),
    };
    assert_eq!(remote.name, "ReferenceError");
    assert_eq!(remote.message, "Failed to call math.add()");
    assert_eq!(call.result().await.unwrap(), json!(1));
}

#[tokio::test]
async fn awaiting_a_generator_returns_it() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address(), config("c1")).await;

    let mut ticker = client.call("detail", "ticker", vec![]);
    assert_eq!(ticker.next(Value::Null).await.unwrap(), IterResult::yielded(json!(1)));
    assert_eq!(ticker.result().await.unwrap(), Value::Null);

    timeout(TIMEOUT, async {
        while fx.returned.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn generator_return_finishes_early() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address(), config("c1")).await;

    let mut ticker = client.call("detail", "ticker", vec![]);
    assert_eq!(ticker.next(Value::Null).await.unwrap(), IterResult::yielded(json!(1)));
    assert_eq!(
        ticker.return_value(json!("bye")).await.unwrap(),
        IterResult::done(json!("bye"))
    );
    assert_eq!(fx.returned.load(Ordering::SeqCst), 1);
    assert_eq!(ticker.next(Value::Null).await.unwrap(), IterResult::done(Value::Null));
}

#[tokio::test]
async fn in_process_server_skips_the_socket() {
    let ctx = AppContext::new();
    let fx = boot(Address::from_port(0, None), Arc::clone(&ctx)).await;

    // Never opened: the call must not need the socket.
    let client = RpcClient::new(fx.address(), Arc::clone(&ctx), config("c1"));
    descriptors(&client);
    let value = client.call("math", "add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(value, json!(5));
    assert_eq!(client.pending_tasks(), 0);
}

// ── Publish / subscribe ─────────────────────────────────────────────

#[tokio::test]
async fn publications_reach_selected_subscribers() {
    let fx = boot_default().await;
    let (first, _c1) = connect(fx.address(), config("c1")).await;
    let (second, _c2) = connect(fx.address(), config("c2")).await;

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let _ = first.subscribe("news", move |payload| {
        let tx = tx1.clone();
        async move {
            let _ = tx.send(payload);
            Ok::<(), RemoteError>(())
        }
    });
    let _ = second.subscribe("news", move |payload| {
        let tx = tx2.clone();
        async move {
            let _ = tx.send(payload);
            Ok::<(), RemoteError>(())
        }
    });

    assert!(fx.server.publish("news", json!({"n": 1}), None).await);
    assert_eq!(timeout(TIMEOUT, rx1.recv()).await.unwrap(), Some(json!({"n": 1})));
    assert_eq!(timeout(TIMEOUT, rx2.recv()).await.unwrap(), Some(json!({"n": 1})));

    let only = vec!["c2".to_owned()];
    assert!(fx.server.publish("news", json!({"n": 2}), Some(only.as_slice())).await);
    assert_eq!(timeout(TIMEOUT, rx2.recv()).await.unwrap(), Some(json!({"n": 2})));
    sleep(Duration::from_millis(100)).await;
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribed_topics_are_ignored() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address(), config("c1")).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = client.subscribe("news", move |payload| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(payload);
            Ok::<(), RemoteError>(())
        }
    });
    assert!(client.unsubscribe("news", Some(id)));

    let _ = fx.server.publish("news", json!(1), None).await;
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

// ── Reconnection ────────────────────────────────────────────────────

#[tokio::test]
async fn call_during_reconnect_completes_after_restart() {
    let fx = boot_default().await;
    let cfg = ClientConfig {
        reconnect_delay_ms: 100,
        ..config("c1")
    };
    let (client, ctx) = connect(fx.address(), cfg).await;
    assert_eq!(client.call("math", "add", vec![json!(1)]).await.unwrap(), json!(1));

    fx.server.close().await;
    wait_for_state(&client, ClientState::Disconnected).await;

    // Routing skips the provider while it is down.
    let err = ctx.call("math", "add", vec![json!(1)]).await.unwrap_err();
    assert!(matches!(err, ChannelError::Unavailable { .. }));

    let pending = tokio::spawn(client.call("math", "add", vec![json!(2), json!(3)]).into_future());
    sleep(Duration::from_millis(150)).await;
    fx.server.open().await.unwrap();

    let value = timeout(TIMEOUT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(value, json!(5));
    assert!(client.is_connected());
    assert_eq!(ctx.call("math", "add", vec![json!(4)]).await.unwrap(), json!(4));
}

#[tokio::test]
async fn lost_connection_fails_in_flight_calls() {
    let fx = boot_default().await;
    let (client, _ctx) = connect(fx.address(), config("c1")).await;

    let pending = tokio::spawn(client.call("detail", "slow", vec![]).into_future());
    sleep(Duration::from_millis(100)).await;
    fx.server.close().await;

    let err = timeout(TIMEOUT, pending).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, ChannelError::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn closed_client_is_unavailable() {
    let fx = boot_default().await;
    let (client, ctx) = connect(fx.address(), config("c1")).await;
    client.close().await;

    assert!(client.is_closed());
    let err = client.call("math", "add", vec![json!(1)]).await.unwrap_err();
    assert_eq!(err.to_string(), "math is not available");
    assert!(!ctx.routing().has_route("math"));

    timeout(TIMEOUT, async {
        while !fx.server.clients().await.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
