//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Request, Response, StatusCode},
    routing::{get, post},
    Router,
};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use overload_guard::config::{GuardConfig, StoreTopology};
use overload_guard::observability::RecordingSink;
use overload_guard::store::{
    CounterConnection, Endpoint, MemoryBackend, StoreBackend, StoreError, StoreResult,
};
use overload_guard::{Guard, GuardServer};

/// Config with a memory store, trusted `X-Forwarded-For` and fast retries.
pub fn test_config() -> GuardConfig {
    let mut config = GuardConfig::default();
    config.store.topology = StoreTopology::Memory;
    config.store.operation_timeout_ms = 200;
    config.rate_limit.trust_forwarded_for = true;
    config.retries.max_attempts = 2;
    config.retries.base_delay_ms = 5;
    config.retries.max_delay_ms = 10;
    config.observability.metrics_enabled = false;
    config
}

/// Small application standing in for the protected service.
pub fn demo_app() -> Router {
    Router::new()
        .route("/", get(|| async { "hello" }))
        .route("/api/items", get(|| async { "items" }))
        .route("/items/{id}", get(|| async { "item" }))
        .route("/boom", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/auth/login", post(login))
}

async fn login(headers: HeaderMap) -> StatusCode {
    if headers.contains_key(axum::http::header::AUTHORIZATION) {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

/// Guard over a fresh in-memory store, recording metrics in memory.
pub fn memory_guard(config: &GuardConfig) -> (Guard, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let guard = Guard::with_backend(config, Arc::new(MemoryBackend::new()), sink.clone());
    (guard, sink)
}

pub fn server(config: &GuardConfig, guard: Guard) -> GuardServer {
    GuardServer::new(config, guard, demo_app())
}

pub fn get_from(path: &str, client: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", client)
        .body(Body::empty())
        .unwrap()
}

pub fn post_from(path: &str, client: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("x-forwarded-for", client)
        .body(Body::empty())
        .unwrap()
}

/// Header value parsed as a number, if present.
pub fn header_u64(response: &Response<Body>, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Store backend whose connections are refused until it is marked healthy.
pub struct SwitchableBackend {
    healthy: AtomicBool,
    inner: MemoryBackend,
    connects: AtomicUsize,
}

impl SwitchableBackend {
    pub fn down() -> Self {
        Self {
            healthy: AtomicBool::new(false),
            inner: MemoryBackend::new(),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreBackend for SwitchableBackend {
    async fn resolve_endpoint(&self) -> StoreResult<Endpoint> {
        Ok(Endpoint::new("127.0.0.1", 6379))
    }

    async fn connect(&self, endpoint: &Endpoint) -> StoreResult<Box<dyn CounterConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            self.inner.connect(endpoint).await
        } else {
            Err(StoreError::Transient("connection refused".into()))
        }
    }
}

/// Minimal RESP server answering the commands the guard sends with canned
/// replies, counting accepted connections and logging every command.
pub struct FakeRedis {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeRedis {
    /// A data node.
    pub async fn start() -> Self {
        Self::spawn(None, false).await
    }

    /// A sentinel reporting `master` for every master name.
    pub async fn sentinel(master: SocketAddr) -> Self {
        Self::spawn(Some(master), false).await
    }

    /// A node acting as both sentinel and the master it reports.
    pub async fn self_sentinel() -> Self {
        Self::spawn(None, true).await
    }

    async fn spawn(master: Option<SocketAddr>, report_self: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let master = if report_self { Some(addr) } else { master };
        let accepted = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let (count, log) = (accepted.clone(), commands.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_resp(socket, master, log.clone()));
            }
        });

        Self {
            addr,
            accepted,
            commands,
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}/0", self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Every logged command whose name is `name`, arguments included.
    pub fn commands_named(&self, name: &str) -> Vec<Vec<String>> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.first().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .cloned()
            .collect()
    }
}

/// A node that accepts connections and never answers.
pub struct SilentNode {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl SilentNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let count = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });
        Self { addr, accepted }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve_resp(
    socket: TcpStream,
    master: Option<SocketAddr>,
    log: Arc<Mutex<Vec<Vec<String>>>>,
) {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);
    while let Some(command) = read_command(&mut reader).await {
        let reply = reply_for(&command, master);
        log.lock().unwrap().push(command);
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn read_command<R: AsyncBufReadExt + AsyncReadExt + Unpin>(reader: &mut R) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut buf = vec![0; len + 2];
        reader.read_exact(&mut buf).await.ok()?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Some(args)
}

fn reply_for(command: &[String], master: Option<SocketAddr>) -> String {
    let name = command.first().map(|c| c.to_ascii_uppercase()).unwrap_or_default();
    match name.as_str() {
        "PING" => "+PONG\r\n".to_string(),
        "CLIENT" | "SELECT" | "AUTH" | "SET" => "+OK\r\n".to_string(),
        "GET" if command.get(1).map(String::as_str) == Some("present") => "$2\r\n17\r\n".to_string(),
        "GET" => "$-1\r\n".to_string(),
        "TTL" => ":42\r\n".to_string(),
        "INCR" => ":5\r\n".to_string(),
        "EXPIRE" => ":1\r\n".to_string(),
        "EVALSHA" | "EVAL" => "*2\r\n:3\r\n:57\r\n".to_string(),
        "SENTINEL" => match master {
            Some(addr) => {
                let host = addr.ip().to_string();
                let port = addr.port().to_string();
                format!("*2\r\n${}\r\n{}\r\n${}\r\n{}\r\n", host.len(), host, port.len(), port)
            }
            None => "*-1\r\n".to_string(),
        },
        _ => format!("-ERR unknown command '{}'\r\n", name),
    }
}
