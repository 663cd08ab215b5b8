//! Server configuration loading from file and environment variables.

use parley_db::DbRuntimeSettings;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Credential verification settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Pub/sub fabric settings.
    #[serde(default)]
    pub fabric: FabricConfig,

    /// Presence store settings.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Per-connection gateway limits.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long a request waits for a pooled connection, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
            acquire_timeout_ms: self.acquire_timeout_ms,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Credential settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Secret material the credential signing key is derived from.
    #[serde(default)]
    pub token_secret: Option<String>,
}

/// Which pub/sub transport carries events between gateway processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FabricBackend {
    /// Single process; events never leave the local table.
    #[default]
    Local,
    /// Redis PUBLISH / PSUBSCRIBE.
    Redis,
}

/// Which store holds the fleet-wide presence counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceBackend {
    /// The shared SQLite database.
    #[default]
    Sqlite,
    /// Redis sets.
    Redis,
}

/// Pub/sub fabric configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    #[serde(default)]
    pub backend: FabricBackend,

    /// Redis URL, shared with the redis presence backend.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Key and channel prefix for everything this gateway writes to Redis.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Presence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    #[serde(default)]
    pub backend: PresenceBackend,

    /// How often this node refreshes its liveness row or Redis lease.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Age after which another node's presence rows are reclaimed. Also the
    /// length of a node's Redis lease.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

/// Gateway limits.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Identity of this process in the presence store. Random when unset.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Bound of each connection's event mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Largest accepted inbound text frame, in bytes.
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "parley.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_acquire_timeout_ms() -> u64 {
    DbRuntimeSettings::default().acquire_timeout_ms
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_redis_prefix() -> String {
    "parley:".to_string()
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_stale_after_secs() -> u64 {
    60
}

fn default_mailbox_capacity() -> usize {
    256
}

fn default_max_message_len() -> usize {
    64 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            backend: FabricBackend::default(),
            redis_url: None,
            prefix: default_redis_prefix(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            backend: PresenceBackend::default(),
            heartbeat_secs: default_heartbeat_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            mailbox_capacity: default_mailbox_capacity(),
            max_message_len: default_max_message_len(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but describes an unusable setup.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Redis URL required by the selected backends, if any of them is redis.
    pub fn required_redis_url(&self) -> Result<Option<&str>, ConfigError> {
        let needs_redis = self.fabric.backend == FabricBackend::Redis
            || self.presence.backend == PresenceBackend::Redis;
        if !needs_redis {
            return Ok(None);
        }
        match self.fabric.redis_url.as_deref() {
            Some(url) if !url.is_empty() => Ok(Some(url)),
            _ => Err(ConfigError::Invalid(
                "a redis backend is selected but fabric.redis_url is not set".to_string(),
            )),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.required_redis_url()?;
        if self.gateway.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "gateway.mailbox_capacity must be at least 1".to_string(),
            ));
        }
        if self.gateway.max_message_len == 0 {
            return Err(ConfigError::Invalid(
                "gateway.max_message_len must be at least 1".to_string(),
            ));
        }
        if self.presence.heartbeat_secs == 0
            || self.presence.stale_after_secs <= self.presence.heartbeat_secs
        {
            return Err(ConfigError::Invalid(
                "presence.stale_after_secs must exceed a non-zero presence.heartbeat_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLEY_HOST` overrides `server.host`
/// - `PARLEY_PORT` overrides `server.port`
/// - `PARLEY_DB_PATH` overrides `database.path`
/// - `PARLEY_LOG_LEVEL` overrides `logging.level`
/// - `PARLEY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PARLEY_TOKEN_SECRET` overrides `auth.token_secret`
/// - `PARLEY_FABRIC` overrides `fabric.backend` (`local` or `redis`)
/// - `PARLEY_REDIS_URL` overrides `fabric.redis_url`
/// - `PARLEY_PRESENCE` overrides `presence.backend` (`sqlite` or `redis`)
/// - `PARLEY_NODE_ID` overrides `gateway.node_id`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// [`load_config`] with the environment lookup supplied by the caller.
pub fn load_config_with(
    path: Option<&str>,
    var: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, var)?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(
    config: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(host) = var("PARLEY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("PARLEY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("PARLEY_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(secret) = var("PARLEY_TOKEN_SECRET") {
        config.auth.token_secret = Some(secret);
    }
    if let Some(backend) = var("PARLEY_FABRIC") {
        config.fabric.backend = match backend.as_str() {
            "local" => FabricBackend::Local,
            "redis" => FabricBackend::Redis,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "PARLEY_FABRIC must be local or redis, got {other:?}"
                )))
            }
        };
    }
    if let Some(url) = var("PARLEY_REDIS_URL") {
        config.fabric.redis_url = Some(url);
    }
    if let Some(backend) = var("PARLEY_PRESENCE") {
        config.presence.backend = match backend.as_str() {
            "sqlite" => PresenceBackend::Sqlite,
            "redis" => PresenceBackend::Redis,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "PARLEY_PRESENCE must be sqlite or redis, got {other:?}"
                )))
            }
        };
    }
    if let Some(node_id) = var("PARLEY_NODE_ID") {
        config.gateway.node_id = Some(node_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.fabric.backend, FabricBackend::Local);
        assert_eq!(config.presence.backend, PresenceBackend::Sqlite);
        assert_eq!(config.gateway.mailbox_capacity, 256);
        assert_eq!(config.gateway.max_message_len, 65536);
    }

    #[test]
    fn parses_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080

            [fabric]
            backend = "redis"
            redis_url = "redis://127.0.0.1/"
            prefix = "test:"

            [presence]
            backend = "redis"

            [gateway]
            node_id = "node-a"
            max_message_len = 1024
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.fabric.backend, FabricBackend::Redis);
        assert_eq!(config.fabric.prefix, "test:");
        assert_eq!(config.presence.backend, PresenceBackend::Redis);
        assert_eq!(config.gateway.node_id.as_deref(), Some("node-a"));
        assert_eq!(config.gateway.max_message_len, 1024);
        assert_eq!(config.gateway.mailbox_capacity, 256);
        assert_eq!(
            config.required_redis_url().unwrap(),
            Some("redis://127.0.0.1/")
        );
    }

    #[test]
    fn redis_backend_without_url_is_invalid() {
        let mut config = Config::default();
        config.presence.backend = PresenceBackend::Redis;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("PARLEY_PORT", "4000"),
                ("PARLEY_DB_PATH", "/tmp/x.db"),
                ("PARLEY_LOG_JSON", "1"),
                ("PARLEY_FABRIC", "redis"),
                ("PARLEY_REDIS_URL", "redis://cache/"),
                ("PARLEY_TOKEN_SECRET", "s3cret"),
                ("PARLEY_NODE_ID", "n1"),
            ]),
        )
        .expect("overrides should apply");

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.database.path, "/tmp/x.db");
        assert!(config.logging.json);
        assert_eq!(config.fabric.backend, FabricBackend::Redis);
        assert_eq!(config.fabric.redis_url.as_deref(), Some("redis://cache/"));
        assert_eq!(config.auth.token_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.gateway.node_id.as_deref(), Some("n1"));
        config.validate().expect("redis url present");
    }

    #[test]
    fn unknown_backend_name_is_invalid() {
        let mut config = Config::default();
        let result = apply_env_overrides(&mut config, env(&[("PARLEY_PRESENCE", "memcached")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn stale_threshold_must_exceed_heartbeat() {
        let mut config = Config::default();
        config.presence.stale_after_secs = config.presence.heartbeat_secs;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config =
            load_config_with(path.to_str(), env(&[])).expect("missing file is not an error");
        assert_eq!(config.database.path, "parley.db");
        assert_eq!(config.fabric.backend, FabricBackend::Local);
    }

    #[test]
    fn file_values_are_overridden_by_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(&path, "[database]\npath = \"from-file.db\"\n").unwrap();

        let config = load_config_with(path.to_str(), env(&[])).unwrap();
        assert_eq!(config.database.path, "from-file.db");

        let config =
            load_config_with(path.to_str(), env(&[("PARLEY_DB_PATH", "from-env.db")])).unwrap();
        assert_eq!(config.database.path, "from-env.db");
    }

    #[test]
    fn invalid_environment_fails_the_load() {
        let result = load_config_with(None, env(&[("PARLEY_FABRIC", "redis")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
