use appgate::config::Config;
use appgate::handler::{DispatchSettings, Dispatcher};
use appgate::pool::{ApplicationPool, PoolSettings, StandardPool};
use appgate::server::GatewayServer;
use appgate::spawn::SpawnCoordinator;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("appgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured, holding its lock until exit
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let guard = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(guard)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The pool owns the spawn coordinator; both live for the process.
    let coordinator = SpawnCoordinator::new(config.spawn.command.clone());
    let pool = StandardPool::new(coordinator, PoolSettings::from(&config.pool));

    let dispatcher = Dispatcher::new(pool.clone(), DispatchSettings::from_config(&config));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(bind_addr, dispatcher, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Retire pooled workers and stop the spawn server
    pool.clear();
    pool.spawner().shutdown().await;

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting gateway"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        document_root = %config.server.document_root.display(),
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        max_pool = config.pool.max_pool,
        max_per_app = config.pool.max_per_app,
        max_idle_secs = config.pool.max_idle_secs,
        "Application pool settings"
    );
    info!(
        spawn_server = ?config.spawn.command,
        spawn_method = %config.spawn.spawn_method,
        lower_privilege = config.spawn.lower_privilege,
        fallback_user = %config.spawn.fallback_user,
        "Spawn settings"
    );
    info!(
        rails_base_uris = ?config.apps.rails_base_uris,
        rack_base_uris = ?config.apps.rack_base_uris,
        auto_detect_rails = config.apps.auto_detect_rails,
        auto_detect_rack = config.apps.auto_detect_rack,
        auto_detect_wsgi = config.apps.auto_detect_wsgi,
        "Application resolution settings"
    );
}

/// Holds the advisory lock on the PID file for the life of the process.
struct PidFileGuard {
    _file: std::fs::File,
}

/// Create the PID file, lock it, and record our PID. A second gateway
/// pointed at the same file fails here instead of binding half the ports.
fn write_pid_file(path: &Path) -> anyhow::Result<PidFileGuard> {
    use std::fs::TryLockError;
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    match file.try_lock() {
        Ok(()) => {}
        Err(TryLockError::WouldBlock) => anyhow::bail!(
            "PID file {} is locked by another running gateway",
            path.display()
        ),
        Err(TryLockError::Error(e)) => return Err(e.into()),
    }
    writeln!(file, "{}", std::process::id())?;
    Ok(PidFileGuard { _file: file })
}
