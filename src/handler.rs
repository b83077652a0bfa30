//! Per-request dispatch to application workers
//!
//! The dispatcher drives one HTTP request end to end: classify the URI
//! against the configured applications, take the static-file and page-cache
//! shortcuts for GETs, buffer large uploads to disk before claiming a scarce
//! worker slot, acquire a session from the pool, send the CGI header frame
//! and the request body, and relay the worker's CGI-style response back as a
//! streaming body. Requests that are not for an application are declined so
//! the host serves them statically.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::{Method, Request, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{AppsConfig, Config, SpawnConfig};
use crate::error::{GatewayBody, GatewayError};
use crate::message::serialize_headers;
use crate::pool::ApplicationPool;
use crate::resolver::{self, Resolution};
use crate::session::Session;
use crate::worker::AppKey;

/// Request bodies larger than this are buffered to a temp file before a
/// worker slot is claimed, so a slow upload never holds a scarce worker.
pub const UPLOAD_ACCELERATION_THRESHOLD: u64 = 8 * 1024;

/// Cap on the worker's response status/header block.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Everything the dispatcher needs besides the pool, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub document_root: PathBuf,
    pub resolver: AppsConfig,
    pub spawn: SpawnConfig,
    pub request_timeout: Duration,
    pub server_software: String,
    pub server_admin: Option<String>,
    pub subprocess_env: Vec<(String, String)>,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut subprocess_env: Vec<(String, String)> = config
            .server
            .subprocess_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        subprocess_env.sort();
        DispatchSettings {
            document_root: config.server.document_root.clone(),
            resolver: config.apps.clone(),
            spawn: config.spawn.clone(),
            request_timeout: config.server.request_timeout(),
            server_software: format!("appgate/{}", env!("CARGO_PKG_VERSION")),
            server_admin: config.server.server_admin.clone(),
            subprocess_env,
        }
    }
}

/// Authenticated username for a request, inserted into the request's
/// extensions by the host's authentication layer. Forwarded to workers as
/// `REMOTE_USER`; requests without one carry an empty value.
#[derive(Debug, Clone)]
pub struct RemoteUser(pub String);

/// Outcome of dispatching one request.
pub enum Dispatch {
    /// The request was handled by an application (or by an error path).
    Response(Response<GatewayBody>),
    /// Not an application request. `file` carries the resolved static file
    /// when the dispatcher already found one (page-cache rewrites included);
    /// `None` means the host should map the URI itself.
    Declined { file: Option<PathBuf> },
}

/// The per-request state machine, generic over the pool implementation.
pub struct Dispatcher<P> {
    pool: P,
    settings: Arc<DispatchSettings>,
}

impl<P: ApplicationPool> Dispatcher<P> {
    pub fn new(pool: P, settings: DispatchSettings) -> Self {
        Dispatcher {
            pool,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Dispatch one request. Errors are rendered into responses here; the
    /// caller only distinguishes handled from declined.
    pub async fn dispatch<B>(
        &self,
        req: Request<B>,
        client: SocketAddr,
        local: SocketAddr,
        is_tls: bool,
    ) -> Dispatch
    where
        B: Body<Data = Bytes> + Send + Unpin,
        B::Error: std::fmt::Display,
    {
        let request_id = Uuid::new_v4().to_string();
        let method = req.method().clone();
        let uri = req.uri().clone();
        debug!(request_id, method = %method, uri = %uri, "Incoming request");

        match self.try_dispatch(req, client, local, is_tls, &request_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                match &e {
                    GatewayError::Busy => {
                        warn!(request_id, uri = %uri, "Pool is saturated, refusing request")
                    }
                    GatewayError::Spawn(spawn) if spawn.has_error_page() => {
                        warn!(request_id, uri = %uri, error = %e, "Serving spawn error page")
                    }
                    _ => error!(request_id, uri = %uri, error = %e, "Request failed"),
                }
                Dispatch::Response(e.to_response())
            }
        }
    }

    async fn try_dispatch<B>(
        &self,
        req: Request<B>,
        client: SocketAddr,
        local: SocketAddr,
        is_tls: bool,
        request_id: &str,
    ) -> Result<Dispatch, GatewayError>
    where
        B: Body<Data = Bytes> + Send + Unpin,
        B::Error: std::fmt::Display,
    {
        let uri_path = req.uri().path().to_string();

        let Some(resolution) =
            resolver::resolve(&uri_path, &self.settings.document_root, &self.settings.resolver)?
        else {
            return Ok(Dispatch::Declined { file: None });
        };

        if resolution.public_dir.as_os_str().is_empty() {
            return Err(GatewayError::DocumentRootUnknown);
        }

        // Existing files, and .html page-cache captures of the URI, are
        // served statically. GET only: non-GET requests always reach the
        // application so REST routes are never shadowed by cached pages.
        let filename = map_filename(&resolution, &uri_path);
        if req.method() == Method::GET {
            if is_file(&filename)? {
                return Ok(Dispatch::Declined {
                    file: Some(filename),
                });
            }
            let cached = page_cache_candidate(&filename, &uri_path);
            if is_file(&cached)? {
                debug!(request_id, file = %cached.display(), "Serving page-cached copy");
                return Ok(Dispatch::Declined { file: Some(cached) });
            }
        }

        let (parts, body) = req.into_parts();

        let content_length = parts
            .headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let expecting_body = content_length.is_some_and(|n| n > 0)
            || parts.headers.contains_key(hyper::header::TRANSFER_ENCODING);

        // Buffer large uploads before claiming a worker slot.
        let body_source = if !expecting_body {
            RequestBody::None
        } else if should_buffer(content_length) {
            let length = content_length.expect("buffering implies an advertised length");
            RequestBody::Buffered(buffer_upload(body, length).await?)
        } else {
            RequestBody::Streaming(body)
        };

        let app_root = resolution.public_dir.join("..");
        let key = AppKey::canonicalize(&app_root).map_err(|e| GatewayError::ResolverFilesystem {
            path: app_root,
            source: e,
        })?;
        let options = self.settings.spawn.options_for(resolution.app_type);

        let mut session = self.pool.get(&key, &options).await?;
        session.set_reader_timeout(self.settings.request_timeout);
        session.set_writer_timeout(self.settings.request_timeout);
        debug!(request_id, key = %key, pid = session.pid(), "Forwarding request to worker");

        let cgi = build_cgi_headers(
            &parts,
            client,
            local,
            is_tls,
            &resolution,
            &self.settings,
        );
        let blob = serialize_headers(cgi.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        session.send_headers(&blob).await?;

        match body_source {
            RequestBody::Buffered(file) => stream_buffered_body(&mut session, file).await?,
            RequestBody::Streaming(body) => stream_client_body(&mut session, body).await?,
            RequestBody::None => {}
        }
        session.shutdown_writer().await?;

        let (status, headers, leftover) = read_response_head(&mut session).await?;
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let response = builder
            .body(relay_response_body(session, leftover))
            .map_err(|e| {
                GatewayError::session_io(
                    "assembling the response",
                    io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
                )
            })?;
        Ok(Dispatch::Response(response))
    }
}

/// Where the request body comes from once the dispatcher has decided whether
/// to accelerate the upload.
enum RequestBody<B> {
    /// Fully on disk already; replayed from the temp file.
    Buffered(tokio::fs::File),
    /// Streamed from the client while the worker slot is held.
    Streaming(B),
    None,
}

/// Whether an advertised body length crosses the upload-acceleration
/// threshold.
fn should_buffer(content_length: Option<u64>) -> bool {
    content_length.is_some_and(|n| n > UPLOAD_ACCELERATION_THRESHOLD)
}

/// Map the request URI onto the application's public directory.
fn map_filename(resolution: &Resolution, uri_path: &str) -> PathBuf {
    let rel = if resolution.base_uri != "/" {
        uri_path.strip_prefix(&resolution.base_uri).unwrap_or("")
    } else {
        uri_path
    };
    resolution.public_dir.join(rel.trim_start_matches('/'))
}

/// The `.html` capture a page-caching application would have written for this
/// URI: `<file>/index.html` for directory URIs, `<file>.html` otherwise.
fn page_cache_candidate(filename: &Path, uri_path: &str) -> PathBuf {
    if uri_path.ends_with('/') {
        filename.join("index.html")
    } else {
        PathBuf::from(format!("{}.html", filename.display()))
    }
}

/// Whether `path` is an existing regular file.
fn is_file(path: &Path) -> Result<bool, GatewayError> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            Ok(false)
        }
        Err(e) => Err(GatewayError::ResolverFilesystem {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Build the CGI variable set for one request: the standard variables, every
/// request header renamed `HTTP_*`, and the host's subprocess environment
/// verbatim.
fn build_cgi_headers(
    parts: &hyper::http::request::Parts,
    client: SocketAddr,
    local: SocketAddr,
    is_tls: bool,
    resolution: &Resolution,
    settings: &DispatchSettings,
) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = Vec::with_capacity(40);
    let mut add = |name: &str, value: String| vars.push((name.to_string(), value));

    let server_name = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_else(|| local.ip().to_string());

    add("SERVER_SOFTWARE", settings.server_software.clone());
    add("SERVER_PROTOCOL", protocol_string(parts.version).to_string());
    add("SERVER_NAME", server_name);
    if let Some(admin) = &settings.server_admin {
        add("SERVER_ADMIN", admin.clone());
    }
    add("SERVER_ADDR", local.ip().to_string());
    add("SERVER_PORT", local.port().to_string());
    add("REMOTE_ADDR", client.ip().to_string());
    add("REMOTE_PORT", client.port().to_string());
    add(
        "REMOTE_USER",
        parts
            .extensions
            .get::<RemoteUser>()
            .map(|user| user.0.clone())
            .unwrap_or_default(),
    );
    add("REQUEST_METHOD", parts.method.as_str().to_string());
    // The URI exactly as the client sent it, not a rewritten form.
    add(
        "REQUEST_URI",
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string(),
    );
    add("QUERY_STRING", parts.uri.query().unwrap_or("").to_string());
    if resolution.base_uri != "/" {
        add("SCRIPT_NAME", resolution.base_uri.clone());
    }
    if is_tls {
        add("HTTPS", "on".to_string());
    }
    if let Some(content_type) = parts.headers.get(hyper::header::CONTENT_TYPE) {
        add(
            "CONTENT_TYPE",
            String::from_utf8_lossy(content_type.as_bytes()).into_owned(),
        );
    }
    add(
        "DOCUMENT_ROOT",
        settings.document_root.display().to_string(),
    );
    add("PATH_INFO", parts.uri.path().to_string());

    for (name, value) in &parts.headers {
        vars.push((
            http_to_env(name.as_str()),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        ));
    }
    for (name, value) in &settings.subprocess_env {
        vars.push((name.clone(), value.clone()));
    }
    vars
}

fn protocol_string(version: hyper::Version) -> &'static str {
    match version {
        hyper::Version::HTTP_09 => "HTTP/0.9",
        hyper::Version::HTTP_10 => "HTTP/1.0",
        hyper::Version::HTTP_11 => "HTTP/1.1",
        hyper::Version::HTTP_2 => "HTTP/2.0",
        hyper::Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// `X-Custom-Header` becomes `HTTP_X_CUSTOM_HEADER`.
fn http_to_env(name: &str) -> String {
    let mut env_name = String::with_capacity(5 + name.len());
    env_name.push_str("HTTP_");
    for c in name.chars() {
        if c == '-' {
            env_name.push('_');
        } else {
            env_name.push(c.to_ascii_uppercase());
        }
    }
    env_name
}

/// Drain the client body into an anonymous temp file, verifying it matches
/// the advertised length. The file is deleted when the handle drops.
async fn buffer_upload<B>(mut body: B, content_length: u64) -> Result<tokio::fs::File, GatewayError>
where
    B: Body<Data = Bytes> + Send + Unpin,
    B::Error: std::fmt::Display,
{
    let file = tempfile::tempfile()
        .map_err(|e| GatewayError::session_io("creating the upload buffer", e))?;
    let mut file = tokio::fs::File::from_std(file);

    let mut written = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| {
            GatewayError::session_io("receiving upload data", io::Error::other(e.to_string()))
        })?;
        if let Ok(data) = frame.into_data() {
            written += data.len() as u64;
            file.write_all(&data)
                .await
                .map_err(|e| GatewayError::session_io("writing upload data to disk", e))?;
        }
    }
    if written != content_length {
        return Err(GatewayError::session_io(
            "receiving upload data",
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("client sent {written} of {content_length} advertised bytes"),
            ),
        ));
    }
    file.flush()
        .await
        .map_err(|e| GatewayError::session_io("writing upload data to disk", e))?;
    file.rewind()
        .await
        .map_err(|e| GatewayError::session_io("rewinding the upload buffer", e))?;
    Ok(file)
}

/// Replay a buffered upload into the session.
async fn stream_buffered_body(
    session: &mut Session,
    mut file: tokio::fs::File,
) -> Result<(), GatewayError> {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| GatewayError::session_io("reading the upload buffer", e))?;
        if n == 0 {
            return Ok(());
        }
        session.send_body_block(&buf[..n]).await?;
    }
}

/// Stream the client body straight through to the worker.
async fn stream_client_body<B>(session: &mut Session, mut body: B) -> Result<(), GatewayError>
where
    B: Body<Data = Bytes> + Send + Unpin,
    B::Error: std::fmt::Display,
{
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| {
            // The worker saw a truncated request; it cannot be reused.
            session.mark_failed();
            GatewayError::session_io("receiving upload data", io::Error::other(e.to_string()))
        })?;
        if let Ok(data) = frame.into_data() {
            session.send_body_block(&data).await?;
        }
    }
    Ok(())
}

/// Read the worker's CGI status/header block. Returns the parsed status and
/// headers plus any body bytes read past the blank line.
async fn read_response_head(
    session: &mut Session,
) -> Result<(StatusCode, Vec<(String, String)>, Bytes), GatewayError> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 8 * 1024];
    let boundary = loop {
        if let Some(found) = find_head_end(&head) {
            break found;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            session.mark_failed();
            return Err(GatewayError::session_io(
                "reading the response",
                io::Error::new(io::ErrorKind::InvalidData, "response header block too large"),
            ));
        }
        let n = session.read_response(&mut buf).await?;
        if n == 0 {
            session.mark_failed();
            return Err(GatewayError::session_io(
                "reading the response",
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "worker closed the stream before completing the response headers",
                ),
            ));
        }
        head.extend_from_slice(&buf[..n]);
    };

    let (head_end, body_start) = boundary;
    let leftover = Bytes::copy_from_slice(&head[body_start..]);
    let (status, headers) = parse_response_head(&head[..head_end]).ok_or_else(|| {
        session.mark_failed();
        GatewayError::session_io(
            "reading the response",
            io::Error::new(io::ErrorKind::InvalidData, "malformed response header block"),
        )
    })?;
    Ok((status, headers, leftover))
}

/// Find the blank line ending a CGI header block. Returns the offset where
/// the headers end and where the body begins.
fn find_head_end(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some((i, i + 4));
        }
        if data[i..].starts_with(b"\n\n") {
            return Some((i, i + 2));
        }
    }
    None
}

/// Parse a CGI header block: a `Status:` header selects the response status
/// (200 otherwise) and is not forwarded; everything else passes through.
fn parse_response_head(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut status = StatusCode::OK;
    let mut headers = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next()?;
            status = StatusCode::from_bytes(code.as_bytes()).ok()?;
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    Some((status, headers))
}

/// Turn the rest of the session's read half into a streaming response body.
/// The session is owned by the relay task, so the worker is released when the
/// response has been fully forwarded (or the client went away).
fn relay_response_body(mut session: Session, leftover: Bytes) -> GatewayBody {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Frame<Bytes>, io::Error>>(8);
    tokio::spawn(async move {
        if !leftover.is_empty() && tx.send(Ok(Frame::data(leftover))).await.is_err() {
            session.mark_failed();
            return;
        }
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match session.read_response(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if tx.send(Ok(Frame::data(chunk))).await.is_err() {
                        // Client went away mid-response; the worker is left
                        // mid-request and cannot be reused.
                        session.mark_failed();
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                    break;
                }
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    StreamBody::new(stream).boxed()
}
