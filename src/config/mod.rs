//! Configuration Module
//!
//! TOML configuration for edgehub:
//! - Listeners (TCP, TLS, WebSocket, WebSocket over TLS)
//! - Protocol limits
//! - Session retention and delivery buffers
//! - Principals and their topic permissions
//! - Rule definitions
//! - Environment variable overrides (`EDGEHUB__` prefix)

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::delivery::MAX_INFLIGHT;

pub use crate::delivery::{DeliveryConfig, OverflowPolicy};
pub use metrics::MetricsConfig;
pub use persistence::{BackendType, PersistenceConfig};
pub use rules::{RuleConfig, RuleEndpoint};

mod metrics;
mod persistence;
mod rules;


const ENV_VAR_PATTERN: &str = r"\$\{([^}:]+)(?::-([^}]*))?\}";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub delivery: DeliveryConfig,
    pub auth: AuthConfig,
    pub acl: AclConfig,
    /// Rule definitions (`[[rules]]`)
    pub rules: Vec<RuleConfig>,
    pub persistence: PersistenceConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain TCP bind address
    pub bind: SocketAddr,
    /// MQTT over TLS (requires `tls`)
    pub tls_bind: Option<SocketAddr>,
    /// MQTT over WebSocket
    pub ws_bind: Option<SocketAddr>,
    /// MQTT over WebSocket over TLS (requires `tls`)
    pub wss_bind: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
    pub tls: Option<ServerTlsConfig>,
}

/// TLS configuration for the server
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerTlsConfig {
    /// Path to certificate chain (PEM)
    pub cert: String,
    /// Path to private key (PEM)
    pub key: String,
    /// CA bundle used to verify client certificates (PEM)
    pub ca_cert: Option<String>,
    /// Reject clients without a certificate chaining to `ca_cert`
    #[serde(default)]
    pub require_client_cert: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
            tls_bind: None,
            ws_bind: None,
            wss_bind: None,
            ws_path: "/mqtt".to_string(),
            tls: None,
        }
    }
}

/// Protocol limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum MQTT packet size in bytes
    pub max_packet_size: usize,
    /// Maximum PUBLISH payload in bytes
    pub max_payload_size: usize,
    /// Maximum client identifier length in characters
    pub max_client_id_length: usize,
    /// Maximum topic length in bytes
    pub max_topic_length: usize,
    /// Maximum number of topic levels
    pub max_topic_levels: usize,
    /// `$` prefixes clients may publish or subscribe to
    pub system_topic_prefixes: Vec<String>,
    /// Time allowed between accept and CONNECT
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Maximum length of a rule chain
    pub max_rule_hops: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_packet_size: 1024 * 1024,
            max_payload_size: 32 * 1024,
            max_client_id_length: 128,
            max_topic_length: 255,
            max_topic_levels: 8,
            system_topic_prefixes: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            max_rule_hops: 8,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a disconnected persistent session is kept
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Interval of the expired session sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Keep alive applied when a client sends 0 (0 = disabled)
    pub default_keep_alive: u16,
    /// Upper bound for the negotiated keep alive in seconds
    pub max_keep_alive: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
            default_keep_alive: 0,
            max_keep_alive: 65535,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow connections without a username when auth is enabled
    pub allow_anonymous: bool,
    /// Configured principals
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// A principal
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Plaintext password
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Role name for topic permissions
    #[serde(default)]
    pub role: Option<String>,
}

/// Topic permission configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Whether permission checks are enabled
    pub enabled: bool,
    pub roles: Vec<AclRole>,
    /// Permissions for principals without a role (including anonymous)
    pub default: AclPermissions,
}

/// Named permission set
#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    pub name: String,
    /// Filters this role may publish to
    #[serde(default)]
    pub publish: Vec<String>,
    /// Filters this role may subscribe to
    #[serde(default)]
    pub subscribe: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `EDGEHUB__` prefix with double underscores for nesting:
    ///    - `EDGEHUB__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `EDGEHUB__LIMITS__MAX_PAYLOAD_SIZE=65536` overrides `limits.max_payload_size`
    ///    - `EDGEHUB__SESSION__RETENTION=5m` overrides `session.retention`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.ws_path", "/mqtt")?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("acl.enabled", false)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file, defaults and environment only
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("EDGEHUB")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.max_client_id_length == 0 || limits.max_client_id_length > 65535 {
            return Err(ConfigError::Validation(
                "limits.max_client_id_length must be between 1 and 65535".to_string(),
            ));
        }
        if limits.max_payload_size == 0 || limits.max_payload_size > limits.max_packet_size {
            return Err(ConfigError::Validation(
                "limits.max_payload_size must be non-zero and at most max_packet_size".to_string(),
            ));
        }
        if limits.max_topic_length > 65535 {
            return Err(ConfigError::Validation(
                "limits.max_topic_length cannot exceed 65535".to_string(),
            ));
        }
        if limits.max_rule_hops == 0 {
            return Err(ConfigError::Validation(
                "limits.max_rule_hops must be at least 1".to_string(),
            ));
        }
        if let Some(prefix) = limits
            .system_topic_prefixes
            .iter()
            .find(|p| !p.starts_with('$') || p.len() < 2)
        {
            return Err(ConfigError::Validation(format!(
                "system topic prefix '{}' must start with '$'",
                prefix
            )));
        }

        let delivery = &self.delivery;
        if delivery.qos0_buffer_size == 0 || delivery.qos1_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "delivery buffer sizes must be non-zero".to_string(),
            ));
        }
        if delivery.max_inflight == 0 || delivery.max_inflight > delivery.qos1_buffer_size {
            return Err(ConfigError::Validation(
                "delivery.max_inflight must be between 1 and qos1_buffer_size".to_string(),
            ));
        }
        if delivery.max_inflight > MAX_INFLIGHT {
            return Err(ConfigError::Validation(format!(
                "delivery.max_inflight cannot exceed {} packet ids",
                MAX_INFLIGHT
            )));
        }
        if delivery.reforward_interval.is_zero() {
            return Err(ConfigError::Validation(
                "delivery.reforward_interval must be non-zero".to_string(),
            ));
        }
        if self.session.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "session.sweep_interval must be non-zero".to_string(),
            ));
        }

        // Validate user password configuration
        let mut usernames = HashSet::new();
        for user in &self.auth.users {
            if !usernames.insert(user.username.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "User '{}' is defined more than once",
                    user.username
                )));
            }
            match (&user.password, &user.password_hash) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' cannot have both 'password' and 'password_hash'",
                        user.username
                    )));
                }
                (None, Some(hash)) if !hash.starts_with("$argon2") => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                        user.username
                    )));
                }
                _ => {}
            }
        }

        // Validate role references
        if self.acl.enabled {
            let role_names: HashSet<_> = self.acl.roles.iter().map(|r| &r.name).collect();
            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        // Validate TLS configuration
        let needs_tls = self.server.tls_bind.is_some() || self.server.wss_bind.is_some();
        match &self.server.tls {
            Some(tls) => {
                if tls.cert.is_empty() || tls.key.is_empty() {
                    return Err(ConfigError::Validation(
                        "tls.cert and tls.key are required".to_string(),
                    ));
                }
                if tls.require_client_cert && tls.ca_cert.is_none() {
                    return Err(ConfigError::Validation(
                        "tls.ca_cert is required when require_client_cert is set".to_string(),
                    ));
                }
            }
            None if needs_tls => {
                return Err(ConfigError::Validation(
                    "tls configuration is required when tls_bind or wss_bind is set".to_string(),
                ));
            }
            None => {}
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "server.ws_path must start with '/'".to_string(),
            ));
        }

        // Rule definitions are compiled here so that errors surface at startup
        crate::rule::RuleEngine::new(&self.rules)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.persistence.enabled && self.persistence.max_batch_size == 0 {
            return Err(ConfigError::Validation(
                "persistence.max_batch_size must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
