//! Error taxonomy and HTML error responses for the gateway

use std::fmt;
use std::io;
use std::path::PathBuf;

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Response body type used throughout the gateway.
pub type GatewayBody = BoxBody<Bytes, io::Error>;

/// Spawning a new application instance failed.
///
/// The spawn server may render a user-facing HTML error page (framework load
/// errors for Rails applications); when present it is preserved verbatim so
/// the dispatcher can serve it instead of a generic error.
#[derive(Debug)]
pub struct SpawnError {
    message: String,
    error_page: Option<String>,
}

impl SpawnError {
    pub fn new(message: impl Into<String>) -> Self {
        SpawnError {
            message: message.into(),
            error_page: None,
        }
    }

    pub fn with_error_page(message: impl Into<String>, page: String) -> Self {
        SpawnError {
            message: message.into(),
            error_page: Some(page),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn has_error_page(&self) -> bool {
        self.error_page.is_some()
    }

    pub fn error_page(&self) -> Option<&str> {
        self.error_page.as_deref()
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not spawn application instance: {}", self.message)
    }
}

impl std::error::Error for SpawnError {}

/// Errors the gateway core distinguishes.
#[derive(Debug)]
pub enum GatewayError {
    /// The spawn server could not produce a worker.
    Spawn(SpawnError),
    /// Pool caps are saturated and no idle worker can be evicted.
    Busy,
    /// I/O against a worker session failed or timed out.
    SessionIo { context: &'static str, source: io::Error },
    /// A filesystem probe failed while classifying the request.
    ResolverFilesystem { path: PathBuf, source: io::Error },
    /// The document root for the request could not be determined.
    DocumentRootUnknown,
    /// A blocking call was interrupted; the host is restarting or shutting down.
    Interrupted,
}

impl GatewayError {
    pub fn session_io(context: &'static str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::Interrupted {
            GatewayError::Interrupted
        } else {
            GatewayError::SessionIo { context, source }
        }
    }

    /// HTTP status the dispatcher answers with.
    ///
    /// A spawn error carrying an error page is the exception: the dispatcher
    /// serves the page with 200 OK so the host does not replace the body with
    /// its generic error page.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Spawn(e) if e.has_error_page() => StatusCode::OK,
            GatewayError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Spawn(_)
            | GatewayError::SessionIo { .. }
            | GatewayError::ResolverFilesystem { .. }
            | GatewayError::DocumentRootUnknown
            | GatewayError::Interrupted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render this error as the HTTP response the client receives.
    pub fn to_response(&self) -> Response<GatewayBody> {
        match self {
            GatewayError::Spawn(e) => match e.error_page() {
                Some(page) => html_response(StatusCode::OK, page.to_string()),
                None => html_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "<h1>Application spawn error</h1>\n\
                     The application could not be started. Please check the server log \
                     for details."
                        .to_string(),
                ),
            },
            GatewayError::Busy => html_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "This website is too busy right now. Please try again later.".to_string(),
            ),
            GatewayError::ResolverFilesystem { path, source } => {
                let mut body = format!(
                    "<h1>Application dispatch error</h1>\n\
                     An error occurred while trying to access '{}': {}",
                    escape_html(&path.display().to_string()),
                    escape_html(&source.to_string()),
                );
                if source.kind() == io::ErrorKind::PermissionDenied {
                    body.push_str(
                        "<p>The web server does not have read permissions to that file. \
                         Please fix the relevant file permissions.</p>",
                    );
                }
                html_response(StatusCode::INTERNAL_SERVER_ERROR, body)
            }
            GatewayError::DocumentRootUnknown => html_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "<h1>Application dispatch error</h1>\n\
                 Cannot determine the document root for the current request."
                    .to_string(),
            ),
            GatewayError::SessionIo { .. } | GatewayError::Interrupted => html_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "<h1>Application request error</h1>\n\
                 The request could not be forwarded to the application. Please check \
                 the server log for details."
                    .to_string(),
            ),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Spawn(e) => write!(f, "{}", e),
            GatewayError::Busy => write!(f, "the application pool is too busy"),
            GatewayError::SessionIo { context, source } => {
                write!(f, "session I/O error while {}: {}", context, source)
            }
            GatewayError::ResolverFilesystem { path, source } => {
                write!(f, "cannot access '{}': {}", path.display(), source)
            }
            GatewayError::DocumentRootUnknown => {
                write!(f, "cannot determine the document root")
            }
            GatewayError::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Spawn(e) => Some(e),
            GatewayError::SessionIo { source, .. } => Some(source),
            GatewayError::ResolverFilesystem { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<SpawnError> for GatewayError {
    fn from(e: SpawnError) -> Self {
        GatewayError::Spawn(e)
    }
}

/// Build an HTML response with the given status.
pub fn html_response(status: StatusCode, body: String) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=UTF-8")
        .body(Full::new(Bytes::from(body)).map_err(io::Error::other).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Minimal HTML escaping for diagnostics interpolated into error pages.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
