//! Configuration management for the Teller binaries
//!
//! Sources, lowest precedence first: `conf/application.yml` (optional,
//! `--config` picks another file), `TELLER_*` environment variables with
//! `__` between key segments (`TELLER_SERVER__PORT=9000`), then command
//! line flags.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use teller_common::DEFAULT_LEASE_DURATION_SECS;
use teller_gateway::auth::DEFAULT_PUBLIC_PATHS;
use teller_gateway::{RateLimitConfig, RouteDefinition};

use crate::startup::LoggingConfig;

pub const DEFAULT_SERVER_PORT: u16 = 8761;
pub const DEFAULT_GATEWAY_PORT: u16 = 8080;
pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

/// Command line arguments shared by both binaries
#[derive(Debug, Default, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", env = "TELLER_CONFIG")]
    pub config_file: Option<String>,
    /// Port of the HTTP listener
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    /// Registry/config server base URL(s), comma separated
    #[arg(long = "registry-url", env = "TELLER_REGISTRY_URL")]
    pub registry_url: Option<String>,
}

/// How the gateway validates inbound tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Static,
    Introspection,
}

/// Fixed token entry of `gateway.auth.tokens`
#[derive(Debug, Clone, Deserialize)]
pub struct StaticTokenEntry {
    pub token: String,
    pub subject: String,
    #[serde(default)]
    pub claims: BTreeMap<String, String>,
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new() -> anyhow::Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let file = cli.config_file.as_deref().unwrap_or(DEFAULT_CONFIG_FILE);
        let mut builder = Config::builder()
            .add_source(File::with_name(file).required(cli.config_file.is_some()))
            .add_source(
                Environment::with_prefix("TELLER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(url) = cli.registry_url {
            builder = builder.set_override("client.registry_url", url)?;
        }

        Ok(Configuration {
            config: builder.build()?,
        })
    }

    pub fn from_config(config: Config) -> Self {
        Configuration { config }
    }

    // ========================================================================
    // Server Configuration
    // ========================================================================

    pub fn server_address(&self) -> String {
        self.config
            .get_string("server.address")
            .unwrap_or("0.0.0.0".to_string())
    }

    pub fn server_port(&self) -> u16 {
        self.config
            .get_int("server.port")
            .map(|p| p as u16)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    // ========================================================================
    // Registry Configuration
    // ========================================================================

    pub fn lease_duration_secs(&self) -> u64 {
        self.config
            .get_int("registry.lease_duration_secs")
            .ok()
            .filter(|v| *v > 0)
            .map(|v| v as u64)
            .unwrap_or(DEFAULT_LEASE_DURATION_SECS)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs())
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.config
            .get_bool("registry.heartbeat.enabled")
            .unwrap_or(true)
    }

    /// Sweep interval; a third of the lease unless configured.
    pub fn heartbeat_interval(&self) -> Duration {
        self.millis("registry.heartbeat.interval_ms")
            .unwrap_or(self.lease_duration() / 3)
    }

    pub fn eviction_grace(&self) -> Duration {
        self.millis("registry.heartbeat.eviction_grace_ms")
            .unwrap_or(Duration::from_secs(90))
    }

    // ========================================================================
    // Config Server Configuration
    // ========================================================================

    /// Directory of persisted bundles; `None` keeps bundles in memory only.
    pub fn config_storage_dir(&self) -> Option<PathBuf> {
        match self.config.get_string("config.storage_dir") {
            Ok(dir) if dir.trim().is_empty() => None,
            Ok(dir) => Some(PathBuf::from(dir)),
            Err(_) => Some(PathBuf::from("data/config")),
        }
    }

    pub fn config_max_wait(&self) -> Duration {
        self.millis("config.max_wait_ms")
            .unwrap_or(Duration::from_secs(30))
    }

    pub fn compaction_enabled(&self) -> bool {
        self.config
            .get_bool("config.compaction.enabled")
            .unwrap_or(true)
    }

    pub fn compaction_interval(&self) -> Duration {
        self.millis("config.compaction.interval_ms")
            .unwrap_or(Duration::from_secs(300))
    }

    pub fn compaction_keep_latest(&self) -> usize {
        self.config
            .get_int("config.compaction.keep_latest")
            .map(|v| v.max(1) as usize)
            .unwrap_or(5)
    }

    // ========================================================================
    // Client Configuration
    // ========================================================================

    pub fn registry_urls(&self) -> Vec<String> {
        self.config
            .get_string("client.registry_url")
            .unwrap_or(format!("http://127.0.0.1:{}", DEFAULT_SERVER_PORT))
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn client_poll_interval(&self) -> Duration {
        self.millis("client.poll_interval_ms")
            .unwrap_or(Duration::from_secs(30))
    }

    pub fn client_request_timeout(&self) -> Duration {
        self.millis("client.request_timeout_ms")
            .unwrap_or(Duration::from_secs(5))
    }

    // ========================================================================
    // Gateway Configuration
    // ========================================================================

    pub fn gateway_port(&self) -> u16 {
        self.config
            .get_int("gateway.port")
            .map(|p| p as u16)
            .unwrap_or(DEFAULT_GATEWAY_PORT)
    }

    /// `--port` applies to whichever binary is starting.
    pub fn gateway_listen_port(&self, cli_port: Option<u16>) -> u16 {
        cli_port.unwrap_or_else(|| self.gateway_port())
    }

    pub fn gateway_service_name(&self) -> String {
        self.config
            .get_string("gateway.service_name")
            .unwrap_or("gateway".to_string())
    }

    /// Host other services reach the gateway on
    pub fn gateway_advertised_host(&self) -> String {
        self.config
            .get_string("gateway.advertised_host")
            .unwrap_or("127.0.0.1".to_string())
    }

    pub fn gateway_routes(&self) -> Result<Vec<RouteDefinition>, ConfigError> {
        match self.config.get::<Vec<RouteDefinition>>("gateway.routes") {
            Err(ConfigError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    pub fn gateway_connect_timeout(&self) -> Duration {
        self.millis("gateway.connect_timeout_ms")
            .unwrap_or(Duration::from_secs(2))
    }

    pub fn gateway_rate_limit(&self) -> Result<RateLimitConfig, ConfigError> {
        match self.config.get::<RateLimitConfig>("gateway.rate_limit") {
            Err(ConfigError::NotFound(_)) => Ok(RateLimitConfig::default()),
            other => other,
        }
    }

    pub fn gateway_public_paths(&self) -> Vec<String> {
        self.config
            .get::<Vec<String>>("gateway.auth.public_paths")
            .unwrap_or_else(|_| DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect())
    }

    pub fn gateway_auth_mode(&self) -> AuthMode {
        match self
            .config
            .get_string("gateway.auth.mode")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "static" => AuthMode::Static,
            "introspection" => AuthMode::Introspection,
            _ => AuthMode::None,
        }
    }

    pub fn gateway_static_tokens(&self) -> Result<Vec<StaticTokenEntry>, ConfigError> {
        match self.config.get::<Vec<StaticTokenEntry>>("gateway.auth.tokens") {
            Err(ConfigError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    pub fn gateway_introspection_url(&self) -> Option<String> {
        self.config
            .get_string("gateway.auth.introspection_url")
            .ok()
    }

    pub fn gateway_introspection_credentials(&self) -> Option<(String, String)> {
        let client_id = self.config.get_string("gateway.auth.client_id").ok()?;
        let client_secret = self
            .config
            .get_string("gateway.auth.client_secret")
            .unwrap_or_default();
        Some((client_id, client_secret))
    }

    pub fn gateway_required_scope(&self) -> Option<String> {
        self.config
            .get_string("gateway.auth.required_scope")
            .ok()
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("logging.dir").ok(),
            self.config.get_bool("logging.console").unwrap_or(true),
            self.config.get_bool("logging.file").unwrap_or(true),
            self.config
                .get_string("logging.level")
                .unwrap_or("info".to_string()),
        )
    }

    fn millis(&self, key: &str) -> Option<Duration> {
        self.config
            .get_int(key)
            .ok()
            .filter(|v| *v > 0)
            .map(|v| Duration::from_millis(v as u64))
    }
}
