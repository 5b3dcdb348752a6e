//! YAML configuration with `${VAR:default}` substitution and env overrides.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::error::RegistryError;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Z0-9_]+)(:([^}]*))?\}").expect("placeholder pattern is valid")
    })
}

/// Replace every `${VAR}` / `${VAR:default}` occurrence in `raw` with the
/// matching environment variable, falling back to the literal default
/// segment, then to an empty string.
fn substitute_env(raw: &str) -> String {
    placeholder_pattern()
        .replace_all(raw, |caps: &regex::Captures| {
            let var = &caps[1];
            match std::env::var(var) {
                Ok(value) => value,
                Err(_) => caps.get(3).map(|m| m.as_str()).unwrap_or("").to_owned(),
            }
        })
        .into_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_redis_port() -> u16 {
    6379
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}", password, self.host, self.port)
            }
            _ => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

/// The `registry:` settings block (spec §6): heartbeat timing, ID-recycling
/// policy, and the debug flag the console's `debug` command toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistrySettings {
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_recycle_ids")]
    pub recycle_ids: bool,
    #[serde(default)]
    pub debug: bool,
}

fn default_heartbeat_timeout() -> u64 {
    15
}

fn default_check_interval() -> u64 {
    5
}

fn default_recycle_ids() -> bool {
    true
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            check_interval: default_check_interval(),
            recycle_ids: default_recycle_ids(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBusType {
    Redis,
    InMemory,
}

impl Default for MessageBusType {
    fn default() -> Self {
        Self::Redis
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessageBusConfig {
    #[serde(default, rename = "type")]
    pub bus_type: MessageBusType,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self { bus_type: MessageBusType::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default, rename = "message-bus")]
    pub message_bus: MessageBusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RegistryConfig {
    /// Parse YAML text, substituting `${VAR:default}` placeholders first,
    /// then applying the `REDIS_HOST`/`REDIS_PORT`/`REDIS_PASSWORD`/
    /// `LOG_LEVEL` environment overrides.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        let substituted = substitute_env(raw);
        let mut config: RegistryConfig = serde_yaml::from_str(&substituted)
            .map_err(|e| RegistryError::PayloadDecodeError(e.to_string()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::OperatorError(format!("reading {path:?}: {e}")))?;
        Self::parse(&raw)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            if let Ok(port) = port.parse() {
                self.redis.port = port;
            }
        }
        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            self.redis.password = Some(password);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
    }
}
