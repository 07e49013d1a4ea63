pub mod sections;
pub mod value;

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;

pub use sections::{
    ConsulConfig, JwtConfig, LoggerConfig, MetricsConfig, MysqlConfig, RabbitmqConfig,
    RedisConfig, RpcConfig, ServerConfig, TracingConfig,
};
pub use value::{parse_duration, FromValue};

/// Error type for configuration operations.
#[derive(Debug)]
pub enum ConfigError {
    /// The requested key was not present.
    NotFound(String),
    /// A required key was absent; the path points at the offending entry.
    MissingKey(String),
    /// The value could not be converted to the requested type.
    TypeMismatch { key: String, expected: &'static str },
    /// An I/O or YAML parsing error while loading config files.
    Load(String),
    /// A config section failed structural validation.
    Invalid { section: String, reason: String },
    /// The removed `ratelimit:` schema was found in the config source.
    LegacySchema(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(key) => write!(f, "config key not found: {key}"),
            ConfigError::MissingKey(path) => {
                write!(f, "missing required config key: {path}")
            }
            ConfigError::TypeMismatch { key, expected } => {
                write!(f, "config type mismatch for '{key}': expected {expected}")
            }
            ConfigError::Load(msg) => write!(f, "config load error: {msg}"),
            ConfigError::Invalid { section, reason } => {
                write!(f, "invalid config section '{section}': {reason}")
            }
            ConfigError::LegacySchema(key) => write!(
                f,
                "legacy '{key}' configuration is no longer supported; \
                 move the rules under 'protection:'"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// The top-level sections this runtime understands. Anything else at the
/// root of the config tree produces a warning; unknown keys are never
/// fatal.
const KNOWN_SECTIONS: &[&str] = &[
    "app", "server", "rpc", "grpc", "logger", "jwt", "consul", "metrics", "mysql", "redis",
    "rabbitmq", "tracing", "protection",
];

/// Hierarchical configuration loaded from YAML files, `.env` files, and
/// environment variables.
///
/// Resolution order (lowest to highest priority):
/// 1. `config.yaml` (base)
/// 2. `config-{env}.yaml` (environment overlay, deep-merged)
/// 3. `.env` file (loaded into the process environment)
/// 4. Environment variables (`SERVER_PORT` overrides `server.port`)
///
/// The active environment is `ENV` ∈ {`development`, `production`},
/// defaulting to `development`.
#[derive(Debug, Clone)]
pub struct Config {
    tree: serde_yaml::Value,
    env: String,
}

impl Config {
    /// Load configuration for the active environment from the working
    /// directory.
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("ENV").unwrap_or_else(|_| "development".to_string());
        Self::load_from_dir(Path::new("."), &env)
    }

    /// Load `config.yaml` + `config-{env}.yaml` from `dir` and overlay the
    /// process environment.
    pub fn load_from_dir(dir: &Path, env: &str) -> Result<Self, ConfigError> {
        let mut tree = serde_yaml::Value::Mapping(Default::default());
        merge_file(&mut tree, &dir.join("config.yaml"))?;
        merge_file(&mut tree, &dir.join(format!("config-{env}.yaml")))?;

        // .env never overwrites variables already set in the environment.
        let _ = dotenvy::dotenv();

        let mut config = Config {
            tree,
            env: env.to_string(),
        };
        config.overlay_environment();
        config.check_root()?;
        Ok(config)
    }

    /// Build a config from a YAML string (tests, embedded defaults).
    pub fn from_yaml_str(yaml: &str, env: &str) -> Result<Self, ConfigError> {
        let tree: serde_yaml::Value =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Load(e.to_string()))?;
        let config = Config {
            tree: if tree.is_null() {
                serde_yaml::Value::Mapping(Default::default())
            } else {
                tree
            },
            env: env.to_string(),
        };
        config.check_root()?;
        Ok(config)
    }

    /// An empty config (tests).
    pub fn empty() -> Self {
        Config {
            tree: serde_yaml::Value::Mapping(Default::default()),
            env: "test".to_string(),
        }
    }

    /// The active environment name (`development` or `production`).
    pub fn env(&self) -> &str {
        &self.env
    }

    pub fn is_production(&self) -> bool {
        self.env == "production"
    }

    /// Get a typed value for a dot-separated key.
    pub fn get<V: FromValue>(&self, key: &str) -> Result<V, ConfigError> {
        let node = self
            .lookup(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        V::from_value(node, key)
    }

    /// Get a typed value, falling back to `default` when the key is absent
    /// or malformed.
    pub fn get_or<V: FromValue>(&self, key: &str, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    /// Get a required value; a missing key is reported with its full path.
    pub fn require<V: FromValue>(&self, key: &str) -> Result<V, ConfigError> {
        match self.get(key) {
            Err(ConfigError::NotFound(path)) => Err(ConfigError::MissingKey(path)),
            other => other,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Set a value programmatically, creating intermediate mappings.
    pub fn set(&mut self, key: &str, value: serde_yaml::Value) {
        fn set_path(node: &mut serde_yaml::Value, parts: &[&str], value: serde_yaml::Value) {
            let Some((head, rest)) = parts.split_first() else {
                return;
            };
            if !matches!(node, serde_yaml::Value::Mapping(_)) {
                *node = serde_yaml::Value::Mapping(Default::default());
            }
            let serde_yaml::Value::Mapping(map) = node else {
                return;
            };
            let key = serde_yaml::Value::String(head.to_string());
            if !map.contains_key(&key) {
                map.insert(key.clone(), serde_yaml::Value::Null);
            }
            let Some(child) = map.get_mut(&key) else {
                return;
            };
            if rest.is_empty() {
                *child = value;
            } else {
                set_path(child, rest, value);
            }
        }
        let parts: Vec<&str> = key.split('.').collect();
        set_path(&mut self.tree, &parts, value);
    }

    /// Decode a whole section into a typed struct.
    ///
    /// Returns `Ok(None)` when the section is absent. A serde "missing
    /// field" failure is converted into [`ConfigError::MissingKey`] carrying
    /// the `section.field` path.
    pub fn section<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        let Some(node) = self.lookup(name) else {
            return Ok(None);
        };
        serde_yaml::from_value(node.clone())
            .map(Some)
            .map_err(|e| missing_field_error(name, e))
    }

    /// Decode a section that must be present.
    pub fn require_section<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConfigError> {
        self.section(name)?
            .ok_or_else(|| ConfigError::MissingKey(name.to_string()))
    }

    /// Warn once for every unrecognized key inside a section.
    pub fn warn_unknown(section: &str, unknown: &BTreeMap<String, serde_yaml::Value>) {
        for key in unknown.keys() {
            tracing::warn!(section, key, "ignoring unknown config key");
        }
    }

    fn lookup(&self, key: &str) -> Option<&serde_yaml::Value> {
        let mut node = &self.tree;
        for part in key.split('.') {
            node = node.get(part)?;
        }
        Some(node)
    }

    /// Refuse the removed schema and warn for unknown root sections.
    fn check_root(&self) -> Result<(), ConfigError> {
        let serde_yaml::Value::Mapping(map) = &self.tree else {
            return Ok(());
        };
        for key in map.keys() {
            let Some(name) = key.as_str() else { continue };
            if name == "ratelimit" || name == "rate_limit" {
                return Err(ConfigError::LegacySchema(name.to_string()));
            }
            if !KNOWN_SECTIONS.contains(&name) {
                tracing::warn!(section = name, "ignoring unknown config section");
            }
        }
        Ok(())
    }

    /// Overlay `UPPER_SNAKE_CASE` environment variables onto the tree.
    ///
    /// `SERVER_PORT=9000` replaces `server.port`. Because YAML keys may
    /// themselves contain underscores, segments are matched greedily against
    /// existing keys; variables that match no existing path are ignored, so
    /// unrelated process environment (PATH, HOME, ...) never leaks in.
    fn overlay_environment(&mut self) {
        for (name, value) in std::env::vars() {
            let segments: Vec<String> = name.split('_').map(|s| s.to_lowercase()).collect();
            if segments.is_empty() {
                continue;
            }
            overlay_env_value(&mut self.tree, &segments, &value);
        }
    }
}

/// Walk `segments` against the mapping, joining consecutive segments with
/// `_` where needed to match existing keys. On a full match of a scalar
/// leaf, replace it with the (string) env value.
fn overlay_env_value(node: &mut serde_yaml::Value, segments: &[String], value: &str) -> bool {
    let serde_yaml::Value::Mapping(map) = node else {
        return false;
    };
    // Longest join first so `rate_limit_rules` beats `rate.limit_rules`.
    for take in (1..=segments.len()).rev() {
        let joined = segments[..take].join("_");
        let key = serde_yaml::Value::String(joined);
        let Some(child) = map.get_mut(&key) else {
            continue;
        };
        if take == segments.len() {
            if !matches!(child, serde_yaml::Value::Mapping(_) | serde_yaml::Value::Sequence(_)) {
                *child = serde_yaml::Value::String(value.to_string());
                return true;
            }
            return false;
        }
        if overlay_env_value(child, &segments[take..], value) {
            return true;
        }
    }
    false
}

fn merge_file(tree: &mut serde_yaml::Value, path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        return Ok(());
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Load(e.to_string()))?;
    let overlay: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::Load(format!("{}: {e}", path.display()))
        })?;
    deep_merge(tree, overlay);
    Ok(())
}

/// Deep-merge `overlay` into `base`: mappings merge recursively, everything
/// else replaces.
fn deep_merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (_, serde_yaml::Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}

/// Convert a serde "missing field" decode failure into a `MissingKey`
/// pointing at `section.field`.
fn missing_field_error(section: &str, err: serde_yaml::Error) -> ConfigError {
    let msg = err.to_string();
    if let Some(rest) = msg.strip_prefix("missing field `") {
        if let Some(field) = rest.split('`').next() {
            return ConfigError::MissingKey(format!("{section}.{field}"));
        }
    }
    ConfigError::Invalid {
        section: section.to_string(),
        reason: msg,
    }
}
