#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::Body,
    http::{header::HeaderMap, Method, Request, StatusCode},
    Router,
};
use dbgate::{
    AccessGuard, AuthorizedPaths, BackendError, DebugBackend, Dispatcher, EventStreams, Gateway,
    Listener, Session,
};
use dbgate_mi::Command;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Backend double that records what it is asked to do.
#[derive(Default)]
pub struct SpyBackend {
    calls: parking_lot::Mutex<Vec<Command>>,
    replies: parking_lot::Mutex<HashMap<&'static str, Result<Value, BackendError>>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    exits: AtomicUsize,
    ended: CancellationToken,
}

impl SpyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command takes `delay` to complete.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the outcome for a command name such as `break-insert`.
    pub fn reply(self, command: &'static str, reply: Result<Value, BackendError>) -> Self {
        self.replies.lock().insert(command, reply);
        self
    }

    pub fn calls(&self) -> Vec<Command> {
        self.calls.lock().clone()
    }

    pub fn exits(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Makes `wait` return, as if gdb exited by itself.
    pub fn end(&self) {
        self.ended.cancel();
    }
}

impl DebugBackend for SpyBackend {
    type Record = Value;

    async fn execute(&self, command: Command) -> Result<Value, BackendError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let name = command.name();
        self.calls.lock().push(command);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.replies
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_else(|| Ok(json!({})))
    }

    async fn exit(&self) {
        self.exits.fetch_add(1, Ordering::SeqCst);
        self.ended.cancel();
    }

    async fn wait(&self) -> Result<(), BackendError> {
        self.ended.cancelled().await;
        Ok(())
    }
}

/// Sending side of the gateway's event streams.
pub struct EventFeed {
    pub console: mpsc::Sender<String>,
    pub target: mpsc::Sender<String>,
    pub log: mpsc::Sender<String>,
    pub records: mpsc::Sender<Value>,
}

fn event_channels() -> (EventFeed, EventStreams<Value>) {
    let (console, console_rx) = mpsc::channel(64);
    let (target, target_rx) = mpsc::channel(64);
    let (log, log_rx) = mpsc::channel(64);
    let (records, records_rx) = mpsc::channel(64);
    (
        EventFeed {
            console,
            target,
            log,
            records,
        },
        EventStreams {
            console: console_rx,
            target: target_rx,
            log: log_rx,
            records: records_rx,
        },
    )
}

pub struct TestGateway {
    pub gateway: Arc<Gateway<SpyBackend>>,
    pub dispatcher: Arc<Dispatcher<SpyBackend>>,
    pub feed: EventFeed,
    pub app: Router,
}

impl TestGateway {
    pub fn spy(&self) -> &SpyBackend {
        self.gateway.session().backend()
    }
}

pub struct GatewayBuilder {
    backend: SpyBackend,
    guard: AccessGuard,
    base: PathBuf,
    roots: Vec<PathBuf>,
    heartbeat: Option<Duration>,
}

impl GatewayBuilder {
    pub fn new(backend: SpyBackend) -> Self {
        Self {
            backend,
            guard: AccessGuard::local(),
            base: std::env::temp_dir(),
            roots: Vec::new(),
            heartbeat: None,
        }
    }

    pub fn guard(mut self, guard: AccessGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn sandbox(mut self, base: impl Into<PathBuf>, roots: Vec<PathBuf>) -> Self {
        self.base = base.into();
        self.roots = roots;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    pub fn build(self) -> TestGateway {
        let (feed, streams) = event_channels();
        let session = Arc::new(Session::new(self.backend));
        let dispatcher = Arc::new(Dispatcher::new(session));
        let mut gateway = Gateway::new(
            dispatcher.clone(),
            streams,
            AuthorizedPaths::new(self.base, self.roots),
        );
        if let Some(interval) = self.heartbeat {
            gateway = gateway.with_heartbeat(interval);
        }
        let gateway = Arc::new(gateway);
        let app = gateway.clone().router(self.guard);
        TestGateway {
            gateway,
            dispatcher,
            feed,
            app,
        }
    }
}

pub fn local_gateway(backend: SpyBackend) -> TestGateway {
    GatewayBuilder::new(backend).build()
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body)
            .unwrap_or_else(|err| panic!("response is not JSON ({err}): {}", self.text()))
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.expect("router is infallible");
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body")
        .to_vec();
    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn post(app: &Router, uri: &str, body: &str) -> TestResponse {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::from(body.to_owned()))
        .unwrap();
    send(app, request).await
}

pub async fn get(app: &Router, uri: &str) -> TestResponse {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

/// Serves `app` on an ephemeral loopback port until the returned token fires.
pub async fn serve(app: Router) -> (SocketAddr, CancellationToken) {
    let listener = Listener::bind("127.0.0.1", 0, None).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = CancellationToken::new();
    tokio::spawn(listener.serve(app, stop.clone()));
    (addr, stop)
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
