//! In-process HTTP server for exercising downloads end to end.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Response, StatusCode};
use axum::Router;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use model_fetch::{DownloaderConfig, RetryPolicy};

pub const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Advertise `Accept-Ranges: bytes` and honour `Range`.
    pub ranges: bool,
    /// Advertise ranges on HEAD but answer every GET with the whole body.
    pub ignore_range: bool,
    pub fail_status: Option<StatusCode>,
    /// Answer HEAD with this status and no headers; GET is unaffected.
    pub head_status: Option<StatusCode>,
    /// First GET sends this many bytes and then breaks the connection.
    pub truncate_first_at: Option<usize>,
    /// First GET sends this many bytes and then goes silent.
    pub stall_first_at: Option<usize>,
    /// Hold every GET until [`TestServer::release`].
    pub gated: bool,
}

struct ServerState {
    content: Vec<u8>,
    behavior: Behavior,
    gate: Semaphore,
    gets: AtomicUsize,
    heads: AtomicUsize,
    ranges_seen: Mutex<Vec<Option<String>>>,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub fn start(content: Vec<u8>, behavior: Behavior) -> Self {
        let state = Arc::new(ServerState {
            content,
            behavior,
            gate: Semaphore::new(0),
            gets: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
            ranges_seen: Mutex::new(Vec::new()),
        });

        let app = Router::new().fallback(serve).with_state(Arc::clone(&state));
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });

        Self {
            addr: rx.recv().unwrap(),
            state,
        }
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://{}/{}", self.addr, name)
    }

    pub fn gets(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.state.heads.load(Ordering::SeqCst)
    }

    pub fn ranges_seen(&self) -> Vec<Option<String>> {
        self.state.ranges_seen.lock().clone()
    }

    pub fn release(&self) {
        self.state.gate.add_permits(1024);
    }
}

fn range_start(value: &str) -> usize {
    value
        .trim_start_matches("bytes=")
        .split('-')
        .next()
        .and_then(|start| start.parse().ok())
        .unwrap_or(0)
}

async fn serve(
    State(state): State<Arc<ServerState>>,
    method: Method,
    headers: HeaderMap,
) -> Response<Body> {
    let total = state.content.len();
    let behavior = &state.behavior;

    if method == Method::HEAD {
        state.heads.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = behavior.head_status {
            return Response::builder()
                .status(status)
                .body(Body::empty())
                .unwrap();
        }
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total);
        if behavior.ranges || behavior.ignore_range {
            response = response.header(header::ACCEPT_RANGES, "bytes");
        }
        return response.body(Body::empty()).unwrap();
    }

    let index = state.gets.fetch_add(1, Ordering::SeqCst);
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges_seen.lock().push(range.clone());

    if behavior.gated {
        state.gate.acquire().await.unwrap().forget();
    }
    if let Some(status) = behavior.fail_status {
        return Response::builder()
            .status(status)
            .body(Body::from("unavailable"))
            .unwrap();
    }

    let ranged = range.is_some() && behavior.ranges && !behavior.ignore_range;
    let start = match &range {
        Some(value) if ranged => range_start(value).min(total),
        _ => 0,
    };
    let body = state.content[start..].to_vec();

    let mut response = Response::builder();
    if ranged {
        response = response.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, total.saturating_sub(1), total),
        );
    } else {
        response = response.status(StatusCode::OK);
    }

    if index == 0 {
        if let Some(cut) = behavior.truncate_first_at {
            let head: Vec<Result<Bytes, io::Error>> = body[..cut.min(body.len())]
                .chunks(256 * 1024)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let broken = stream::iter(head).chain(stream::once(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "cut"))
            }));
            return response.body(Body::from_stream(broken)).unwrap();
        }
        if let Some(cut) = behavior.stall_first_at {
            let head: Vec<Result<Bytes, io::Error>> = body[..cut.min(body.len())]
                .chunks(256 * 1024)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let stalled = stream::iter(head).chain(stream::pending());
            return response.body(Body::from_stream(stalled)).unwrap();
        }
    }

    response
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ (i / 4096) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn fast_config(temp_dir: &std::path::Path) -> DownloaderConfig {
    DownloaderConfig::default()
        .with_temp_dir(temp_dir)
        .with_max_retries(3)
        .with_retry_delay(Duration::from_millis(10))
        .with_http_retry(RetryPolicy::default().with_retries(1, Duration::from_millis(10)))
        .with_worker_threads(2)
        .with_progress_poll(Duration::from_millis(20))
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
