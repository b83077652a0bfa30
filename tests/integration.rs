//! Integration tests for Appgate

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use appgate::config::Config;
use appgate::handler::{DispatchSettings, Dispatcher};
use appgate::pool::{PoolSettings, StandardPool};
use appgate::resolver;
use appgate::server::GatewayServer;
use appgate::spawn::SpawnCoordinator;
use appgate::worker::AppType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Build a deployed Rails application fixture; returns the tempdir holding
/// the application root.
fn rails_fixture() -> tempfile::TempDir {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("config")).unwrap();
    std::fs::create_dir_all(dir.path().join("public")).unwrap();
    std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
    std::fs::write(dir.path().join("config/environment.rb"), "# rails").unwrap();
    dir
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a simple HTTP request and get the raw response
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

#[test]
fn config_loads_from_a_toml_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [server]
        port = 48801
        document_root = "/srv/store/public"

        [pool]
        max_pool = 8
        max_per_app = 2

        [spawn]
        command = ["/usr/local/bin/spawn-server"]
        "#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.server.port, 48801);
    assert_eq!(config.pool.max_pool, 8);
    assert_eq!(config.pool.max_per_app, 2);
    assert_eq!(config.spawn.command, vec!["/usr/local/bin/spawn-server"]);
}

#[test]
fn config_load_rejects_invalid_settings() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    // No spawn server command configured.
    std::fs::write(&path, "[server]\nport = 1\n").unwrap();
    assert!(Config::load(&path).is_err());
}

#[test]
fn resolver_detects_the_fixture_application() {
    let app = rails_fixture();
    let public = app.path().join("public");

    let resolution = resolver::resolve("/orders", &public, &Default::default())
        .unwrap()
        .expect("fixture must resolve as an application");
    assert_eq!(resolution.app_type, AppType::Rails);
    assert_eq!(resolution.base_uri, "/");
    assert_eq!(resolution.public_dir, public);
}

#[test]
fn header_blobs_keep_an_even_field_count() {
    // A trailing empty value is the case the sentinel exists for.
    let blob = appgate::message::serialize_headers([
        ("REQUEST_METHOD", "GET"),
        ("SSL_CLIENT_CERT", ""),
    ]);
    let fields: Vec<&[u8]> = blob.split(|b| *b == 0).collect();
    // Trailing split artifact aside, the field count is even.
    let meaningful = fields.len() - 1;
    assert_eq!(meaningful % 2, 0);
    assert!(blob.ends_with(b"_\0_\0"));
}

/// Full server pass: static assets and page-cached captures are served
/// without a worker, and an application request that cannot spawn turns into
/// the documented 500.
#[tokio::test(flavor = "multi_thread")]
async fn server_serves_statics_and_reports_spawn_failures() {
    let app = rails_fixture();
    let public = app.path().join("public");
    std::fs::write(public.join("style.css"), "body { color: red }").unwrap();
    std::fs::write(public.join("about.html"), "<html>cached about</html>").unwrap();
    std::fs::write(public.join("index.html"), "<html>front page</html>").unwrap();

    let port = 48731u16;
    let config: Config = toml::from_str(&format!(
        r#"
        [server]
        port = {port}
        bind = "127.0.0.1"
        document_root = "{}"

        [spawn]
        command = ["/bin/cat"]
        "#,
        public.display()
    ))
    .unwrap();

    let coordinator = SpawnCoordinator::new(config.spawn.command.clone());
    let pool = StandardPool::new(coordinator, PoolSettings::from(&config.pool));
    let dispatcher = Dispatcher::new(pool, DispatchSettings::from_config(&config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bind_addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let server = GatewayServer::new(bind_addr, dispatcher, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        let _ = server.run().await;
    });
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    // A plain static asset.
    let response = http_get(port, "/style.css").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("text/css"));
    assert!(response.contains("color: red"));

    // The page-cache shortcut rewrites /about to about.html.
    let response = http_get(port, "/about").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("cached about"));

    // And / to index.html.
    let response = http_get(port, "/").await.unwrap();
    assert!(response.contains("front page"));

    // An uncached application URI reaches the pool; /bin/cat is not a spawn
    // server, so the request fails with the documented 500.
    let response = http_get(port, "/orders/list").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 500"));
    assert!(response.contains("Application spawn error"));

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
}

/// The config file fixture documented in the README-level docs parses into
/// working dispatch settings.
#[test]
fn dispatch_settings_derive_from_config() {
    let config: Config = toml::from_str(
        r#"
        [server]
        document_root = "/srv/store/public"
        request_timeout_secs = 45
        server_admin = "ops@example.com"

        [spawn]
        command = ["/usr/local/bin/spawn-server"]
        rails_env = "staging"
        "#,
    )
    .unwrap();

    let settings = DispatchSettings::from_config(&config);
    assert_eq!(settings.document_root, PathBuf::from("/srv/store/public"));
    assert_eq!(settings.request_timeout, Duration::from_secs(45));
    assert_eq!(settings.server_admin.as_deref(), Some("ops@example.com"));
    assert_eq!(
        settings.spawn.options_for(AppType::Rails).environment,
        "staging"
    );
}
