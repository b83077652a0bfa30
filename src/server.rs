//! Host HTTP server integration
//!
//! A thin accept loop binding the dispatcher into hyper. Requests the
//! dispatcher declines are served statically from the document root, which is
//! how the page-cache shortcut and plain assets reach the client.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{html_response, GatewayBody};
use crate::handler::{Dispatch, Dispatcher};
use crate::pool::ApplicationPool;

/// The gateway's front-facing HTTP server.
pub struct GatewayServer<P> {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher<P>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<P: ApplicationPool> GatewayServer<P> {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Dispatcher<P>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        GatewayServer {
            bind_addr,
            dispatcher: Arc::new(dispatcher),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, client, local, dispatcher).await
                                {
                                    debug!(client = %client, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection<P: ApplicationPool>(
    stream: TcpStream,
    client: SocketAddr,
    local: SocketAddr,
    dispatcher: Arc<Dispatcher<P>>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let uri_path = req.uri().path().to_string();
            let response = match dispatcher.dispatch(req, client, local, false).await {
                Dispatch::Response(response) => response,
                Dispatch::Declined { file } => {
                    serve_static(file, &dispatcher.settings().document_root, &uri_path).await
                }
            };
            Ok::<_, Infallible>(response)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;
    Ok(())
}

/// Serve a static file for a declined request. `file` is the path the
/// dispatcher already resolved (page-cache rewrites included); without one,
/// the URI is mapped onto the document root.
async fn serve_static(
    file: Option<PathBuf>,
    document_root: &Path,
    uri_path: &str,
) -> Response<GatewayBody> {
    let path = file.unwrap_or_else(|| document_root.join(uri_path.trim_start_matches('/')));

    match tokio::fs::read(&path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, content_type_for(&path))
            .body(Full::new(Bytes::from(bytes)).map_err(std::io::Error::other).boxed())
            .expect("valid response with StatusCode enum and static headers"),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Static file not served");
            html_response(
                StatusCode::NOT_FOUND,
                "<h1>Not Found</h1>\nThe requested URL was not found on this server."
                    .to_string(),
            )
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=UTF-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=UTF-8",
        _ => "application/octet-stream",
    }
}
