use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::worker::{AppType, SpawnMethod, SpawnOptions};

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Host server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Application pool caps
    #[serde(default)]
    pub pool: PoolConfig,

    /// Spawn server settings and per-type spawn defaults
    #[serde(default)]
    pub spawn: SpawnConfig,

    /// Application resolution settings
    #[serde(default)]
    pub apps: AppsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Document root requests are resolved against
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,

    /// Per-request timeout in seconds, applied to worker reads and writes
    /// (default: 60, 0 disables the timeout)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Value reported as SERVER_ADMIN to applications
    pub server_admin: Option<String>,

    /// Extra environment entries forwarded verbatim in every request's
    /// CGI variable set
    #[serde(default)]
    pub subprocess_env: HashMap<String, String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            document_root: default_document_root(),
            request_timeout_secs: default_request_timeout(),
            server_admin: None,
            subprocess_env: HashMap::new(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Hard limit on spawned worker instances across all applications
    /// (default: 6)
    #[serde(default = "default_max_pool")]
    pub max_pool: usize,

    /// Hard limit on worker instances per application (default: 0, unlimited)
    #[serde(default)]
    pub max_per_app: usize,

    /// Seconds a worker may sit idle before the sweeper retires it
    /// (default: 120)
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool: default_max_pool(),
            max_per_app: 0,
            max_idle_secs: default_max_idle(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpawnConfig {
    /// Spawn server command line: program followed by its arguments.
    ///
    /// **Security:** this command is executed directly. Protect the
    /// configuration file with appropriate permissions.
    #[serde(default)]
    pub command: Vec<String>,

    /// Environment for Rails applications (default: production)
    #[serde(default = "default_environment")]
    pub rails_env: String,

    /// Environment for Rack applications (default: production)
    #[serde(default = "default_environment")]
    pub rack_env: String,

    /// Environment for WSGI applications (default: production)
    #[serde(default = "default_environment")]
    pub wsgi_env: String,

    /// Spawn strategy: "smart" or "conservative" (default: smart)
    #[serde(default = "default_spawn_method")]
    pub spawn_method: String,

    /// Whether workers run with lowered privileges (default: true)
    #[serde(default = "default_lower_privilege")]
    pub lower_privilege: bool,

    /// User to fall back to when lowering privileges fails (default: nobody)
    #[serde(default = "default_fallback_user")]
    pub fallback_user: String,
}

impl SpawnConfig {
    /// Spawn options for one application type, as passed to `Pool::get`.
    pub fn options_for(&self, app_type: AppType) -> SpawnOptions {
        let environment = match app_type {
            AppType::Rails => &self.rails_env,
            AppType::Rack => &self.rack_env,
            AppType::Wsgi => &self.wsgi_env,
        };
        SpawnOptions {
            lower_privilege: self.lower_privilege,
            fallback_user: self.fallback_user.clone(),
            environment: environment.clone(),
            spawn_method: self.parsed_spawn_method(),
            app_type,
        }
    }

    fn parsed_spawn_method(&self) -> SpawnMethod {
        if self.spawn_method == "conservative" {
            SpawnMethod::Conservative
        } else {
            SpawnMethod::Smart
        }
    }
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            rails_env: default_environment(),
            rack_env: default_environment(),
            wsgi_env: default_environment(),
            spawn_method: default_spawn_method(),
            lower_privilege: default_lower_privilege(),
            fallback_user: default_fallback_user(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppsConfig {
    /// URI prefixes under which Rails applications are mounted
    #[serde(default)]
    pub rails_base_uris: Vec<String>,

    /// URI prefixes under which Rack applications are mounted
    #[serde(default)]
    pub rack_base_uris: Vec<String>,

    /// Probe the document root for Rails marker files (default: true)
    #[serde(default = "default_auto_detect")]
    pub auto_detect_rails: bool,

    /// Probe the document root for Rack marker files (default: true)
    #[serde(default = "default_auto_detect")]
    pub auto_detect_rack: bool,

    /// Probe the document root for WSGI marker files (default: true)
    #[serde(default = "default_auto_detect")]
    pub auto_detect_wsgi: bool,
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            rails_base_uris: Vec::new(),
            rack_base_uris: Vec::new(),
            auto_detect_rails: true,
            auto_detect_rack: true,
            auto_detect_wsgi: true,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.spawn.command.is_empty() {
            anyhow::bail!("spawn.command must name the spawn server executable");
        }
        if self.spawn.fallback_user.is_empty() {
            anyhow::bail!("spawn.fallback_user must not be empty");
        }
        for (name, env) in [
            ("rails_env", &self.spawn.rails_env),
            ("rack_env", &self.spawn.rack_env),
            ("wsgi_env", &self.spawn.wsgi_env),
        ] {
            if env.is_empty() {
                anyhow::bail!("spawn.{} must not be empty", name);
            }
        }
        if !matches!(self.spawn.spawn_method.as_str(), "smart" | "conservative") {
            anyhow::bail!(
                "spawn.spawn_method must be \"smart\" or \"conservative\", got {:?}",
                self.spawn.spawn_method
            );
        }
        Ok(())
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_document_root() -> PathBuf {
    PathBuf::from("./public")
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_pool() -> usize {
    6
}

fn default_max_idle() -> u64 {
    120
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_spawn_method() -> String {
    "smart".to_string()
}

fn default_lower_privilege() -> bool {
    true
}

fn default_fallback_user() -> String {
    "nobody".to_string()
}

fn default_auto_detect() -> bool {
    true
}
