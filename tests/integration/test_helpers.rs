// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

#![allow(dead_code)]

use flomd::config::Config;
use flomd::core::protocol::{
    FlomCodec, ManagementAction, Message, ReplyCode, ResourceRequest, Verb,
};
use flomd::server::{self, DaemonHandle};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;

/// How long a test waits for a single message before failing.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// A configuration listening on an ephemeral loopback TCP port that never
/// exits on its own.
pub fn tcp_config() -> Config {
    Config {
        unicast_address: Some("127.0.0.1".to_string()),
        unicast_port: 0,
        idle_lifespan: Duration::ZERO,
        locker_sweep_interval: Duration::from_millis(50),
        ..Config::default()
    }
}

/// TestDaemon runs a real daemon for the duration of one test.
pub struct TestDaemon {
    pub handle: Option<DaemonHandle>,
    _dir: Option<tempfile::TempDir>,
}

impl TestDaemon {
    pub async fn start() -> Self {
        Self::with_config(tcp_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        init_tracing();
        let handle = server::spawn(config).await.expect("daemon should start");
        Self {
            handle: Some(handle),
            _dir: None,
        }
    }

    /// Starts a daemon listening on a unix socket inside a temporary directory.
    pub async fn on_unix_socket() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            socket_path: dir.path().join("flomd.sock").to_string_lossy().into_owned(),
            idle_lifespan: Duration::ZERO,
            ..Config::default()
        };
        let mut daemon = Self::with_config(config).await;
        daemon._dir = Some(dir);
        daemon
    }

    pub fn handle(&self) -> &DaemonHandle {
        self.handle.as_ref().expect("daemon is running")
    }

    pub async fn connect(&self) -> TestClient<TcpStream> {
        let addr = self.handle().tcp_addr().expect("daemon listens on tcp");
        let stream = TcpStream::connect(addr).await.expect("connect");
        TestClient::new(stream)
    }

    pub async fn connect_unix(&self) -> TestClient<UnixStream> {
        let path = self.handle().unix_path().expect("daemon listens on unix");
        let stream = UnixStream::connect(path).await.expect("connect");
        TestClient::new(stream)
    }

    /// Number of live lockers.
    pub fn locker_count(&self) -> usize {
        self.handle().mirror.len()
    }

    /// Polls until `condition` holds or the timeout expires.
    pub async fn wait_until(&self, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }

    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
            let _ = tokio::time::timeout(RECV_TIMEOUT, handle.wait()).await;
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.shutdown();
        }
    }
}

/// A protocol client over any stream.
pub struct TestClient<S> {
    pub framed: Framed<S, FlomCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, FlomCodec),
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.framed.send(message).await.expect("send");
    }

    /// Receives the next message, failing the test on timeout or EOF.
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed unexpectedly")
            .expect("decode error")
    }

    /// Returns the next message if one arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Message> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(message))) => Some(message),
            _ => None,
        }
    }

    /// True when the daemon closed (or half-closed) its side of the connection.
    pub async fn is_closed_by_peer(&mut self) -> bool {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(None) | Ok(Some(Err(_))) => true,
            Ok(Some(Ok(_))) | Err(_) => false,
        }
    }

    pub async fn lock(&mut self, request: ResourceRequest) -> Message {
        self.send(Message::lock_request(request, None)).await;
        self.recv().await
    }

    pub async fn lock_name(&mut self, name: &str) -> Message {
        self.lock(ResourceRequest::new(name)).await
    }

    pub async fn unlock(&mut self, name: &str) {
        self.send(Message::unlock(name, false)).await;
    }

    pub async fn manage(&mut self, action: ManagementAction) -> Message {
        self.send(Message::management(action)).await;
        self.recv().await
    }
}

/// Asserts a Lock answer with the given step and code, returning its element.
pub fn assert_answer(message: &Message, step: u32, rc: ReplyCode) -> Option<String> {
    assert_eq!(message.verb, Verb::Lock, "unexpected verb in {message:?}");
    assert_eq!(message.step, step, "unexpected step in {message:?}");
    assert_eq!(message.reply_code(), Some(rc), "unexpected code in {message:?}");
    match &message.body {
        flomd::core::protocol::Body::Answer { element, .. } => element.clone(),
        _ => None,
    }
}
