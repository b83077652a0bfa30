//! Spawn coordinator: owns the external spawn server
//!
//! The spawn server is a long-lived child process that forks application
//! workers on demand; it parents and reaps every worker it creates. The
//! coordinator talks to it over the child's stdio pipes using the framed
//! records from [`crate::message`], serializing spawn requests behind its own
//! lock so they never contend with the pool lock. A dead channel is repaired
//! by restarting the spawn server once before the failure is surfaced.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SpawnError;
use crate::message::{read_array, read_scalar, write_array};
use crate::worker::{AppKey, AppType, Endpoint, SpawnOptions, Worker};

/// Command field of a spawn request record.
pub const SPAWN_COMMAND: &str = "spawn_application";

/// Source of freshly spawned workers.
///
/// The pool is generic over this seam; production uses [`SpawnCoordinator`],
/// tests substitute their own.
pub trait Spawner: Send + Sync + 'static {
    /// Spawn a new worker for `key`. Never retried by the pool: a failure is
    /// surfaced to the dispatcher as-is.
    fn spawn(
        &self,
        key: &AppKey,
        options: &SpawnOptions,
    ) -> impl std::future::Future<Output = Result<Worker, SpawnError>> + Send;

    /// PID of the backing spawn-server process, if one is running.
    fn spawn_server_pid(&self) -> Option<u32>;
}

/// Why one request/reply exchange with the spawn server failed.
#[derive(Debug)]
enum ExchangeError {
    /// The channel itself broke; the server is restarted once.
    Channel(std::io::Error),
    /// The server answered with a spawn failure; not retried.
    Spawn(SpawnError),
}

/// One request/reply exchange on an established channel.
async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    key: &AppKey,
    options: &SpawnOptions,
) -> Result<Worker, ExchangeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let key_str = key.as_path().to_string_lossy();
    let request = [
        SPAWN_COMMAND,
        &key_str,
        options.app_type.as_str(),
        &options.environment,
        options.spawn_method.as_str(),
        if options.lower_privilege { "true" } else { "false" },
        &options.fallback_user,
    ];
    write_array(writer, &request)
        .await
        .map_err(ExchangeError::Channel)?;

    let reply = read_array(reader)
        .await
        .map_err(ExchangeError::Channel)?
        .ok_or_else(|| {
            ExchangeError::Channel(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "spawn server closed the channel",
            ))
        })?;

    match reply.first().map(String::as_str) {
        Some("ok") => {
            let (pid, endpoint) = match (reply.get(1), reply.get(2)) {
                (Some(pid), Some(endpoint)) => (pid, endpoint),
                _ => {
                    return Err(ExchangeError::Spawn(SpawnError::new(format!(
                        "malformed ok reply from spawn server: {reply:?}"
                    ))))
                }
            };
            let pid: u32 = pid.parse().map_err(|_| {
                ExchangeError::Spawn(SpawnError::new(format!(
                    "spawn server sent a non-numeric pid: {pid:?}"
                )))
            })?;
            Ok(Worker::new(
                key.clone(),
                options.clone(),
                pid,
                Endpoint::parse(endpoint),
            ))
        }
        Some("error") => {
            let message = reply
                .get(1)
                .cloned()
                .unwrap_or_else(|| "spawn server reported an error".to_string());
            // Rails spawns always carry one scalar record after the error
            // reply: the rendered HTML error page, empty when there is none.
            if options.app_type == AppType::Rails {
                let page = read_scalar(reader)
                    .await
                    .map_err(ExchangeError::Channel)?
                    .ok_or_else(|| {
                        ExchangeError::Channel(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "spawn server closed the channel before the error page",
                        ))
                    })?;
                if page.is_empty() {
                    Err(ExchangeError::Spawn(SpawnError::new(message)))
                } else {
                    Err(ExchangeError::Spawn(SpawnError::with_error_page(
                        message,
                        String::from_utf8_lossy(&page).into_owned(),
                    )))
                }
            } else {
                Err(ExchangeError::Spawn(SpawnError::new(message)))
            }
        }
        _ => Err(ExchangeError::Spawn(SpawnError::new(format!(
            "unexpected reply from spawn server: {reply:?}"
        )))),
    }
}

/// A running spawn-server child and its stdio channel.
struct SpawnServer {
    child: Option<Child>,
    pid: u32,
    writer: ChildStdin,
    reader: ChildStdout,
}

impl Drop for SpawnServer {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}

/// Coordinates spawn requests against one spawn-server child.
pub struct SpawnCoordinator {
    command: Vec<String>,
    server: Mutex<Option<SpawnServer>>,
    /// PID of the current server; 0 when none is running.
    server_pid: AtomicU32,
}

impl SpawnCoordinator {
    /// Create a coordinator for the given spawn server command line. The
    /// server is started lazily on the first spawn request.
    pub fn new(command: Vec<String>) -> Self {
        SpawnCoordinator {
            command,
            server: Mutex::new(None),
            server_pid: AtomicU32::new(0),
        }
    }

    fn start_server(&self) -> Result<SpawnServer, SpawnError> {
        let program = self.command.first().ok_or_else(|| {
            SpawnError::new("no spawn server command configured")
        })?;

        let mut child = Command::new(program)
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SpawnError::new(format!("cannot start spawn server {program:?}: {e}")))?;

        let writer = child.stdin.take().expect("stdin was piped");
        let reader = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let pid = child.id().unwrap_or(0);

        // Relay the server's stderr into our log.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(source = "spawn-server", "{}", line);
            }
        });

        info!(pid, program = %program, "Spawn server started");
        self.server_pid.store(pid, Ordering::SeqCst);

        Ok(SpawnServer {
            child: Some(child),
            pid,
            writer,
            reader,
        })
    }

    /// Stop the spawn server, if running. The next spawn restarts it.
    pub async fn shutdown(&self) {
        let mut slot = self.server.lock().await;
        if let Some(server) = slot.take() {
            info!(pid = server.pid, "Stopping spawn server");
            drop(server);
        }
        self.server_pid.store(0, Ordering::SeqCst);
    }

    /// Release the spawn-server handle without stopping the process.
    ///
    /// Called once per host-worker process after the host forks: the
    /// parent-side control channel closes and ownership of the server stays
    /// with the child context. The coordinator starts a fresh server if it is
    /// asked to spawn again afterwards.
    pub async fn detach(&self) {
        let mut slot = self.server.lock().await;
        if let Some(mut server) = slot.take() {
            debug!(pid = server.pid, "Detaching from spawn server");
            // Disarm the kill-on-drop so the process keeps running.
            server.child.take();
        }
        self.server_pid.store(0, Ordering::SeqCst);
    }
}

impl Spawner for SpawnCoordinator {
    fn spawn(
        &self,
        key: &AppKey,
        options: &SpawnOptions,
    ) -> impl std::future::Future<Output = Result<Worker, SpawnError>> + Send {
        async move {
            let mut slot = self.server.lock().await;

            // One transparent restart of the spawn server on channel death.
            for attempt in 0..2 {
                if slot.is_none() {
                    *slot = Some(self.start_server()?);
                }
                let server = slot.as_mut().expect("spawn server started above");

                match exchange(&mut server.reader, &mut server.writer, key, options).await {
                    Ok(worker) => {
                        debug!(
                            key = %key,
                            pid = worker.pid(),
                            endpoint = %worker.endpoint(),
                            "Spawned application instance"
                        );
                        return Ok(worker);
                    }
                    Err(ExchangeError::Spawn(e)) => return Err(e),
                    Err(ExchangeError::Channel(e)) => {
                        warn!(
                            attempt,
                            error = %e,
                            "Spawn server channel failed, restarting the server"
                        );
                        *slot = None;
                        self.server_pid.store(0, Ordering::SeqCst);
                    }
                }
            }

            Err(SpawnError::new(
                "the spawn server channel failed and restarting the server did not help",
            ))
        }
    }

    fn spawn_server_pid(&self) -> Option<u32> {
        match self.server_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}
