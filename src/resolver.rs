//! URI-to-application directory resolution
//!
//! Given a request URI and a document root, determine whether the request
//! belongs to a deployed application, which base URI the application is
//! mounted under, what kind of application it is, and where its `public`
//! directory lives. Consulted by the dispatcher before the pool is touched;
//! a `None` result means the request is not for an application and the host
//! serves it statically.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::AppsConfig;
use crate::error::GatewayError;
use crate::worker::AppType;

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// URI prefix the application is mounted under. `/` for the root.
    pub base_uri: String,
    pub app_type: AppType,
    /// The application's `public` directory: the document root with one
    /// trailing slash stripped and the base URI appended when not `/`.
    pub public_dir: PathBuf,
}

/// Resolve a request URI against the configured applications.
///
/// Explicitly configured Rails base URIs are consulted first, then Rack base
/// URIs; a base matches when it equals the URI, is a prefix ending exactly at
/// a `/`, or is `"/"` itself. When no explicit base matches and
/// auto-detection is enabled, the document root is probed for marker files,
/// Rails before Rack before WSGI.
pub fn resolve(
    uri: &str,
    document_root: &Path,
    config: &AppsConfig,
) -> Result<Option<Resolution>, GatewayError> {
    if uri.is_empty() || !uri.starts_with('/') {
        return Ok(None);
    }

    for base in &config.rails_base_uris {
        if base_matches(uri, base) {
            return Ok(Some(resolution(base, AppType::Rails, document_root)));
        }
    }
    for base in &config.rack_base_uris {
        if base_matches(uri, base) {
            return Ok(Some(resolution(base, AppType::Rack, document_root)));
        }
    }

    if config.auto_detect_rails && is_rails_public_dir(document_root)? {
        return Ok(Some(resolution("/", AppType::Rails, document_root)));
    }
    if config.auto_detect_rack && is_rack_public_dir(document_root)? {
        return Ok(Some(resolution("/", AppType::Rack, document_root)));
    }
    if config.auto_detect_wsgi && is_wsgi_public_dir(document_root)? {
        return Ok(Some(resolution("/", AppType::Wsgi, document_root)));
    }

    Ok(None)
}

fn base_matches(uri: &str, base: &str) -> bool {
    base == "/"
        || uri == base
        || (uri.len() > base.len()
            && uri.starts_with(base)
            && uri.as_bytes()[base.len()] == b'/')
}

fn resolution(base_uri: &str, app_type: AppType, document_root: &Path) -> Resolution {
    Resolution {
        base_uri: base_uri.to_string(),
        app_type,
        public_dir: public_dir_for(document_root, base_uri),
    }
}

fn public_dir_for(document_root: &Path, base_uri: &str) -> PathBuf {
    let root = document_root.to_string_lossy();
    let root = root.strip_suffix('/').unwrap_or(&root);
    if base_uri == "/" {
        PathBuf::from(root)
    } else {
        PathBuf::from(format!("{root}{base_uri}"))
    }
}

/// Whether `dir` looks like the `public` directory of a Rails application.
fn is_rails_public_dir(dir: &Path) -> Result<bool, GatewayError> {
    file_exists(&dir.join("../config/environment.rb"))
}

/// Whether `dir` looks like the `public` directory of a Rack application.
fn is_rack_public_dir(dir: &Path) -> Result<bool, GatewayError> {
    file_exists(&dir.join("../config.ru"))
}

/// Whether `dir` looks like the `public` directory of a WSGI application.
fn is_wsgi_public_dir(dir: &Path) -> Result<bool, GatewayError> {
    file_exists(&dir.join("../wsgi_app.py"))
}

/// Stat a marker path. Absence is `false`; any other filesystem failure is a
/// resolver error the dispatcher reports with a diagnostic.
pub(crate) fn file_exists(path: &Path) -> Result<bool, GatewayError> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            Ok(false)
        }
        Err(e) => Err(GatewayError::ResolverFilesystem {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
