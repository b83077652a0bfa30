//! Appgate - a web gateway that pools per-application worker processes
//!
//! This library serves HTTP requests by routing them to long-lived worker
//! processes, one application per worker:
//! - Resolves request URIs to deployed applications (Rails, Rack, WSGI) by
//!   base URI or marker-file auto-detection
//! - Maintains a bounded pool of workers keyed by application root, with
//!   per-application caps, LRU eviction, and idle retirement
//! - Spawns workers on demand through an external spawn server reached over
//!   a framed record channel
//! - Speaks a CGI-style session protocol to workers, with upload
//!   acceleration for large request bodies
//! - Honors `tmp/restart.txt` as an on-disk restart signal per application
//! - Serves static assets and page-cached captures without touching a worker

pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod pool;
pub mod resolver;
pub mod server;
pub mod session;
pub mod spawn;
pub mod worker;
