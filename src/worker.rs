//! Worker handles and endpoint addressing
//!
//! A [`Worker`] is an opaque reference to one live application process: its
//! PID, the stream endpoint it listens on, and the bookkeeping the pool needs
//! (last-use timestamp, session flag, generation). Workers are constructed by
//! the spawn coordinator, owned by the pool while idle, and transferred to a
//! session while busy. The worker's OS process is parented and reaped by the
//! spawn server, never by this crate.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// Canonicalized absolute filesystem path identifying one application.
///
/// Two keys are equal iff their canonical paths are byte-equal; no
/// normalization beyond what the OS canonicalization returns is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppKey(PathBuf);

impl AppKey {
    /// Canonicalize `path` and use the result as the application key.
    pub fn canonicalize(path: &Path) -> io::Result<Self> {
        std::fs::canonicalize(path).map(AppKey)
    }

    /// Wrap a path that is already canonical (test fixtures, config values).
    pub fn assume_canonical(path: impl Into<PathBuf>) -> Self {
        AppKey(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Path of the restart signal file for this application.
    pub fn restart_file(&self) -> PathBuf {
        self.0.join("tmp").join("restart.txt")
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// The kind of application running behind a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppType {
    Rails,
    Rack,
    Wsgi,
}

impl AppType {
    /// Wire-protocol name of this application type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Rails => "rails",
            AppType::Rack => "rack",
            AppType::Wsgi => "wsgi",
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy the spawn server uses to start a new worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpawnMethod {
    /// Preload the framework and fork per application.
    Smart,
    /// Start every worker from scratch.
    Conservative,
}

impl SpawnMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnMethod::Smart => "smart",
            SpawnMethod::Conservative => "conservative",
        }
    }
}

/// Options passed with each pool `get`, forwarded to the spawn server.
///
/// Workers remember the options they were spawned with; a worker only
/// satisfies a `get` carrying equal options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Whether the spawn server should drop privileges for the worker.
    pub lower_privilege: bool,
    /// User to fall back to when lowering privileges fails. Never empty.
    pub fallback_user: String,
    /// Framework environment (`production`, `development`, ...). Never empty.
    pub environment: String,
    pub spawn_method: SpawnMethod,
    pub app_type: AppType,
}

/// Stream address a worker listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Parse an endpoint string from a spawn reply.
    ///
    /// Accepted forms: `unix:<path>`, `tcp:<host>:<port>`. A bare string is
    /// treated as a Unix socket path.
    pub fn parse(s: &str) -> Self {
        if let Some(path) = s.strip_prefix("unix:") {
            Endpoint::Unix(PathBuf::from(path))
        } else if let Some(addr) = s.strip_prefix("tcp:") {
            Endpoint::Tcp(addr.to_string())
        } else {
            Endpoint::Unix(PathBuf::from(s))
        }
    }

    /// Open a bidirectional stream to this endpoint.
    pub async fn connect(&self) -> io::Result<WorkerStream> {
        match self {
            Endpoint::Unix(path) => Ok(WorkerStream::Unix(UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => Ok(WorkerStream::Tcp(TcpStream::connect(addr.as_str()).await?)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// A connected stream to a worker endpoint.
pub enum WorkerStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl WorkerStream {
    /// Peer address, for logs. Unix endpoints have none.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            WorkerStream::Unix(_) => None,
            WorkerStream::Tcp(s) => s.peer_addr().ok(),
        }
    }
}

impl AsyncRead for WorkerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            WorkerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WorkerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WorkerStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            WorkerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Unix(s) => Pin::new(s).poll_flush(cx),
            WorkerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            WorkerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One live application instance.
#[derive(Debug)]
pub struct Worker {
    pub(crate) key: AppKey,
    pub(crate) options: SpawnOptions,
    pub(crate) pid: u32,
    pub(crate) endpoint: Endpoint,
    /// 0 while idle, 1 while a session holds the worker.
    pub(crate) sessions: u32,
    pub(crate) last_used_at: Instant,
    /// Restart generation of the owning application at install time.
    pub(crate) generation: u64,
}

impl Worker {
    pub fn new(key: AppKey, options: SpawnOptions, pid: u32, endpoint: Endpoint) -> Self {
        Worker {
            key,
            options,
            pid,
            endpoint,
            sessions: 0,
            last_used_at: Instant::now(),
            generation: 0,
        }
    }

    pub fn key(&self) -> &AppKey {
        &self.key
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &SpawnOptions {
        &self.options
    }

    /// Whether this worker can serve a `get` carrying `options`.
    pub fn matches(&self, options: &SpawnOptions) -> bool {
        self.options == *options
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }
}
