//! Typed views over the well-known config sections.
//!
//! Each adapter-facing section is parsed here even when the adapter itself
//! lives outside this workspace (`mysql`, `redis`, `rabbitmq`, `consul`,
//! `jwt`): startup validates the operator's file once, the adapter receives
//! a ready struct. Unknown keys inside a section are collected by the
//! `unknown` flatten map and reported as warnings by [`Section::load`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{Config, ConfigError};

/// Serde helpers for duration fields: accepts `30s`/`250ms` literals or a
/// bare number of seconds.
pub mod duration_serde {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        crate::config::value::FromValue::from_value(&value, "duration")
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;
        use serde::Deserializer;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let value = serde_yaml::Value::deserialize(deserializer)?;
            if value.is_null() {
                return Ok(None);
            }
            crate::config::value::FromValue::from_value(&value, "duration")
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// A named, self-validating config section.
pub trait Section: DeserializeOwned {
    const NAME: &'static str;

    /// Keys the decoder collected but did not recognize.
    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value>;

    /// Structural checks beyond what serde enforces.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Decode the section from `config`, warn for unknown keys, validate.
    fn load(config: &Config) -> Result<Option<Self>, ConfigError> {
        let Some(section) = config.section::<Self>(Self::NAME)? else {
            return Ok(None);
        };
        Config::warn_unknown(Self::NAME, section.unknown_keys());
        section.validate()?;
        Ok(Some(section))
    }
}

fn invalid(section: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section: section.to_string(),
        reason: reason.into(),
    }
}

// ── server ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default, with = "duration_serde::option")]
    pub request_timeout: Option<Duration>,
    #[serde(default = "default_drain", with = "duration_serde")]
    pub drain_timeout: Duration,
    /// Close keep-alive connections that sit idle between requests.
    #[serde(default, with = "duration_serde::option")]
    pub idle_timeout: Option<Duration>,
    /// Drain and close connections once they reach this age.
    #[serde(default, with = "duration_serde::option")]
    pub max_connection_age: Option<Duration>,
    /// HTTP/2 keep-alive ping interval.
    #[serde(default = "default_ping", with = "duration_serde")]
    pub ping_interval: Duration,
    #[serde(default)]
    pub enable_admin: bool,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_drain() -> Duration {
    Duration::from_secs(5)
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Section for ServerConfig {
    const NAME: &'static str = "server";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }
}

// ── rpc (accepted under `grpc` as an alias) ─────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: u32,
    #[serde(default, with = "duration_serde::option")]
    pub request_timeout: Option<Duration>,
    #[serde(default = "default_idle", with = "duration_serde")]
    pub idle_timeout: Duration,
    #[serde(default, with = "duration_serde::option")]
    pub max_connection_age: Option<Duration>,
    #[serde(default = "default_ping", with = "duration_serde")]
    pub ping_interval: Duration,
    #[serde(default = "default_drain", with = "duration_serde")]
    pub drain_timeout: Duration,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

fn default_max_frame() -> u32 {
    1024 * 1024
}

fn default_idle() -> Duration {
    Duration::from_secs(120)
}

fn default_ping() -> Duration {
    Duration::from_secs(30)
}

impl RpcConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `rpc:` is the canonical name; `grpc:` is accepted for compatibility
    /// with older config files.
    pub fn load_with_alias(config: &Config) -> Result<Option<Self>, ConfigError> {
        if config.contains_key("rpc") {
            return Self::load(config);
        }
        let Some(section) = config.section::<Self>("grpc")? else {
            return Ok(None);
        };
        Config::warn_unknown("grpc", section.unknown_keys());
        section.validate()?;
        Ok(Some(section))
    }
}

impl Section for RpcConfig {
    const NAME: &'static str = "rpc";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_bytes == 0 {
            return Err(invalid(Self::NAME, "max_frame_bytes must be positive"));
        }
        Ok(())
    }
}

// ── logger ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub format: LogFormat,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            unknown: BTreeMap::new(),
        }
    }
}

impl Section for LoggerConfig {
    const NAME: &'static str = "logger";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }
}

// ── jwt ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default = "default_jwt_expiry", with = "duration_serde")]
    pub expiry: Duration,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

fn default_jwt_expiry() -> Duration {
    Duration::from_secs(24 * 3600)
}

impl Section for JwtConfig {
    const NAME: &'static str = "jwt";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(invalid(Self::NAME, "secret must not be empty"));
        }
        Ok(())
    }
}

// ── consul ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ConsulConfig {
    pub address: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default = "default_health_interval", with = "duration_serde")]
    pub health_interval: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_enabled() -> bool {
    true
}

impl ConsulConfig {
    /// In development the registry address resolves against localhost; in
    /// production the container name from `NAME` is advertised instead.
    pub fn advertised_host(&self, config: &Config) -> String {
        if config.is_production() {
            std::env::var("NAME").unwrap_or_else(|_| "localhost".to_string())
        } else {
            "localhost".to_string()
        }
    }
}

impl Section for ConsulConfig {
    const NAME: &'static str = "consul";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }
}

// ── metrics ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
    pub namespace: String,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
            namespace: "trellis".to_string(),
            unknown: BTreeMap::new(),
        }
    }
}

impl Section for MetricsConfig {
    const NAME: &'static str = "metrics";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }
}

// ── data stores (adapters are out-of-tree; sections validate here) ──────

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlConfig {
    pub dsn: String,
    #[serde(default = "default_pool_size")]
    pub max_open_conns: u32,
    #[serde(default = "default_pool_idle")]
    pub max_idle_conns: u32,
    #[serde(default = "default_conn_lifetime", with = "duration_serde")]
    pub conn_max_lifetime: Duration,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

fn default_pool_size() -> u32 {
    50
}

fn default_pool_idle() -> u32 {
    10
}

fn default_conn_lifetime() -> Duration {
    Duration::from_secs(3600)
}

impl Section for MysqlConfig {
    const NAME: &'static str = "mysql";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dsn.is_empty() {
            return Err(invalid(Self::NAME, "dsn must not be empty"));
        }
        if self.max_idle_conns > self.max_open_conns {
            return Err(invalid(
                Self::NAME,
                "max_idle_conns must not exceed max_open_conns",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub address: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: u32,
    #[serde(default = "default_pool_idle")]
    pub pool_size: u32,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

impl Section for RedisConfig {
    const NAME: &'static str = "redis";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RabbitmqConfig {
    pub url: String,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

impl Section for RabbitmqConfig {
    const NAME: &'static str = "rabbitmq";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }
}

// ── tracing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub service_name: String,
    pub sample_ratio: f64,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: "trellis".to_string(),
            sample_ratio: 1.0,
            unknown: BTreeMap::new(),
        }
    }
}

impl Section for TracingConfig {
    const NAME: &'static str = "tracing";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sample_ratio) {
            return Err(invalid(Self::NAME, "sample_ratio must be within [0, 1]"));
        }
        Ok(())
    }
}
