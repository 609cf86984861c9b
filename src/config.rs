//! Configuration management for Blockgate.
//!
//! Configuration is read once at startup from an optional YAML file and
//! `BLOCKGATE__`-prefixed environment variables (double underscore between
//! levels, e.g. `BLOCKGATE__POLICY__IP__LIMIT=20`), then shared immutably.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{GateError, Result};
use crate::ratelimit::PolicyTable;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "BLOCKGATE";

/// Unprefixed variables kept from earlier deployments, applied beneath
/// every other source.
pub const COMPAT_VARS: [&str; 5] = [
    "REDIS_ADDR",
    "RATE_LIMIT_IP",
    "RATE_LIMIT_TOKEN",
    "BLOCK_TIME",
    "SERVER_PORT",
];

/// Main configuration for the Blockgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limit policies
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Request header carrying the client credential
    #[serde(default = "default_credential_header")]
    pub credential_header: String,

    /// Take the client address from `X-Forwarded-For` when present.
    /// Only enable behind a proxy that sets the header itself.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            credential_header: default_credential_header(),
            trust_forwarded_for: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_credential_header() -> String {
    "API_KEY".to_string()
}

/// Which storage backend holds counters and block markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local map; state is lost on restart and not shared.
    Memory,
    /// Shared Redis instance.
    #[default]
    Redis,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: BackendKind,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on a single Redis command, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// How often the memory backend evicts expired records, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis_url: default_redis_url(),
            command_timeout_ms: default_command_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_command_timeout() -> u64 {
    500
}

fn default_cleanup_interval() -> u64 {
    60
}

/// Limit, window and block duration, as written in configuration.
///
/// Each field may be omitted on its own; omitted fields keep the default of
/// the rule they belong to (see [`PolicyConfig`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyRule {
    /// Requests allowed per window (inclusive)
    pub limit: u64,
    /// Counting window in seconds
    pub window_secs: u64,
    /// Block duration in seconds
    pub block_secs: u64,
}

/// A rule as it appears in a configuration source, before defaults apply.
#[derive(Debug, Default, Deserialize)]
struct PartialRule {
    limit: Option<u64>,
    window_secs: Option<u64>,
    block_secs: Option<u64>,
}

impl PartialRule {
    fn over(self, base: PolicyRule) -> PolicyRule {
        PolicyRule {
            limit: self.limit.unwrap_or(base.limit),
            window_secs: self.window_secs.unwrap_or(base.window_secs),
            block_secs: self.block_secs.unwrap_or(base.block_secs),
        }
    }
}

fn deserialize_ip_rule<'de, D>(deserializer: D) -> std::result::Result<PolicyRule, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(PartialRule::deserialize(deserializer)?.over(default_ip_rule()))
}

fn deserialize_token_rule<'de, D>(deserializer: D) -> std::result::Result<PolicyRule, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(PartialRule::deserialize(deserializer)?.over(default_token_rule()))
}

fn default_window() -> u64 {
    30
}

fn default_block() -> u64 {
    300
}

fn default_ip_rule() -> PolicyRule {
    PolicyRule {
        limit: 10,
        window_secs: default_window(),
        block_secs: default_block(),
    }
}

fn default_token_rule() -> PolicyRule {
    PolicyRule {
        limit: 100,
        window_secs: default_window(),
        block_secs: default_block(),
    }
}

/// Per-credential override. Unset fields fall back to the token default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOverride {
    /// The credential this override applies to
    pub token: String,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub block_secs: Option<u64>,
}

/// Rate limit policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy for requests identified by client address
    #[serde(default = "default_ip_rule", deserialize_with = "deserialize_ip_rule")]
    pub ip: PolicyRule,

    /// Default policy for requests presenting a credential
    #[serde(default = "default_token_rule", deserialize_with = "deserialize_token_rule")]
    pub token: PolicyRule,

    /// Per-credential overrides
    #[serde(default)]
    pub overrides: Vec<TokenOverride>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ip: default_ip_rule(),
            token: default_token_rule(),
            overrides: Vec::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GateConfig {
    /// Load configuration from an optional YAML file layered under
    /// environment variables, and validate it.
    ///
    /// Precedence, lowest first: built-in defaults, the unprefixed variables
    /// listed in [`COMPAT_VARS`], the file, `BLOCKGATE__` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// As [`GateConfig::load`], reading variables from `vars` instead of the
    /// process environment when given.
    fn load_from(path: Option<&Path>, vars: Option<HashMap<String, String>>) -> Result<Self> {
        let lookup = |name: &str| match &vars {
            Some(vars) => vars.get(name).cloned(),
            None => std::env::var(name).ok(),
        };
        let mut builder = compat_defaults(config::Config::builder(), lookup)?;

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(vars.clone()),
            )
            .build()?;

        let config: GateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that would otherwise only fail at request time.
    pub fn validate(&self) -> Result<()> {
        if self.server.credential_header.is_empty() {
            return Err(GateError::Config("credential_header must not be empty".to_string()));
        }
        if axum::http::HeaderName::from_bytes(self.server.credential_header.as_bytes()).is_err() {
            return Err(GateError::Config(format!(
                "invalid credential_header: {:?}",
                self.server.credential_header
            )));
        }
        if self.storage.command_timeout_ms == 0 {
            return Err(GateError::Config("command_timeout_ms must be positive".to_string()));
        }
        if self.storage.cleanup_interval_secs == 0 {
            return Err(GateError::Config("cleanup_interval_secs must be positive".to_string()));
        }
        PolicyTable::from_config(&self.policy)?;
        Ok(())
    }
}

type Builder = config::ConfigBuilder<config::builder::DefaultState>;

/// Seed `builder` with the [`COMPAT_VARS`] found by `lookup`. Empty values
/// count as unset.
fn compat_defaults<F>(mut builder: Builder, lookup: F) -> Result<Builder>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(addr) = get("REDIS_ADDR") {
        let url = if addr.contains("://") {
            addr
        } else {
            format!("redis://{}", addr.trim())
        };
        builder = builder.set_default("storage.redis_url", url)?;
    }
    if let Some(limit) = get("RATE_LIMIT_IP") {
        builder = builder.set_default("policy.ip.limit", parse_var::<u64>("RATE_LIMIT_IP", &limit)?)?;
    }
    if let Some(limit) = get("RATE_LIMIT_TOKEN") {
        builder =
            builder.set_default("policy.token.limit", parse_var::<u64>("RATE_LIMIT_TOKEN", &limit)?)?;
    }
    if let Some(secs) = get("BLOCK_TIME") {
        let secs = parse_var::<u64>("BLOCK_TIME", &secs)?;
        builder = builder
            .set_default("policy.ip.block_secs", secs)?
            .set_default("policy.token.block_secs", secs)?;
    }
    if let Some(port) = get("SERVER_PORT") {
        let port = parse_var::<u16>("SERVER_PORT", &port)?;
        builder = builder.set_default("server.listen_addr", format!("0.0.0.0:{}", port))?;
    }
    Ok(builder)
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GateError::Config(format!("invalid {}: {:?}", name, value)))
}
