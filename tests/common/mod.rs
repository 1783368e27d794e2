//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use proxy_fleet::config::FleetConfig;
use proxy_fleet::engine::{EngineError, EngineHandle, ProxyEngine};
use proxy_fleet::instance::{InstanceRuntime, LaunchSpec, ProxyInstance};
use proxy_fleet::traffic::{self, Dispatch, Verdict};
use proxy_fleet::ProxyRegistry;

/// Engine double. Binds nothing; records what the registry asked of it.
#[derive(Debug, Default)]
pub struct MockEngine {
    busy: Mutex<HashSet<u16>>,
    failing: Mutex<HashSet<u16>>,
    started: Mutex<Vec<u16>>,
    stopped: Arc<Mutex<Vec<u16>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report `port` as taken by another process.
    pub fn occupy(&self, port: u16) {
        self.busy.lock().unwrap().insert(port);
    }

    /// Fail to start on `port` for a reason other than the port being taken.
    pub fn fail_on(&self, port: u16) {
        self.failing.lock().unwrap().insert(port);
    }

    pub fn started(&self) -> Vec<u16> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<u16> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyEngine for MockEngine {
    async fn start(
        &self,
        port: u16,
        _spec: &LaunchSpec,
        _runtime: Arc<InstanceRuntime>,
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        if self.busy.lock().unwrap().contains(&port) {
            return Err(EngineError::AddressInUse(port));
        }
        if self.failing.lock().unwrap().contains(&port) {
            return Err(EngineError::Client("simulated start failure".into()));
        }
        self.started.lock().unwrap().push(port);
        Ok(Box::new(MockHandle {
            port,
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

#[derive(Debug)]
struct MockHandle {
    port: u16,
    stopped: Arc<Mutex<Vec<u16>>>,
}

#[async_trait]
impl EngineHandle for MockHandle {
    fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port)
    }

    async fn stop(&mut self) {
        self.stopped.lock().unwrap().push(self.port);
    }
}

/// Config with a small port range, so exhaustion is cheap to reach.
pub fn test_config(start: u16, end: u16) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.ports.start = start;
    config.ports.end = end;
    config.ports.max_attempts = u32::from(end - start) + 1;
    config
}

pub fn mock_registry(start: u16, end: u16) -> (Arc<ProxyRegistry>, Arc<MockEngine>) {
    let engine = MockEngine::new();
    let registry = ProxyRegistry::new(&test_config(start, end), engine.clone());
    (Arc::new(registry), engine)
}

/// Requests the simulated engine sent upstream.
#[derive(Debug, Default, Clone)]
pub struct Dispatches(Arc<Mutex<Vec<Dispatch>>>);

impl Dispatches {
    pub fn all(&self) -> Vec<Dispatch> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Push one request through an instance the way an engine would: hold an
/// activity guard, evaluate against the current snapshot, record dispatches.
/// Returns the status a client would see (200 for dispatched requests).
pub async fn simulate_request(
    instance: &ProxyInstance,
    dispatches: &Dispatches,
    method: &str,
    url: &str,
    upstream_time: Duration,
) -> u16 {
    let _guard = instance.activity().begin();
    let settings = instance.settings();
    match traffic::evaluate(&settings, method, url) {
        Verdict::Respond { status, .. } => status,
        Verdict::Dispatch(dispatch) => {
            dispatches.0.lock().unwrap().push(dispatch);
            tokio::time::sleep(upstream_time).await;
            200
        }
    }
}

/// Start an upstream on an ephemeral port that answers every request with
/// `200` and a body echoing the request head it received.
pub async fn start_mock_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let head = read_head(&mut socket).await;
                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nSet-Cookie: session=abc\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            head.len(),
                            head
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

async fn read_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let text = String::from_utf8_lossy(&buf);
    text.split("\r\n\r\n").next().unwrap_or_default().to_string()
}

/// A free local port, released before returning.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
