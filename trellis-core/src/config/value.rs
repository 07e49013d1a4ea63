use std::time::Duration;

use super::ConfigError;

/// Trait for converting a YAML node into a concrete config type.
///
/// Scalar coercion is deliberately permissive: numbers and booleans stored
/// as strings (the usual result of environment-variable overrides) convert
/// to their typed forms.
pub trait FromValue: Sized {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError>;
}

fn mismatch(key: &str, expected: &'static str) -> ConfigError {
    ConfigError::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}

impl FromValue for String {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        match value {
            serde_yaml::Value::String(s) => Ok(s.clone()),
            serde_yaml::Value::Number(n) => Ok(n.to_string()),
            serde_yaml::Value::Bool(b) => Ok(b.to_string()),
            _ => Err(mismatch(key, "string")),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        match value {
            serde_yaml::Value::Number(n) => n.as_i64().ok_or_else(|| mismatch(key, "integer")),
            serde_yaml::Value::String(s) => s.parse().map_err(|_| mismatch(key, "integer")),
            _ => Err(mismatch(key, "integer")),
        }
    }
}

impl FromValue for u64 {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        let v = i64::from_value(value, key)?;
        u64::try_from(v).map_err(|_| mismatch(key, "non-negative integer"))
    }
}

impl FromValue for u32 {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        let v = u64::from_value(value, key)?;
        u32::try_from(v).map_err(|_| mismatch(key, "u32"))
    }
}

impl FromValue for u16 {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        let v = u64::from_value(value, key)?;
        u16::try_from(v).map_err(|_| mismatch(key, "u16"))
    }
}

impl FromValue for f64 {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        match value {
            serde_yaml::Value::Number(n) => n.as_f64().ok_or_else(|| mismatch(key, "float")),
            serde_yaml::Value::String(s) => s.parse().map_err(|_| mismatch(key, "float")),
            _ => Err(mismatch(key, "float")),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        match value {
            serde_yaml::Value::Bool(b) => Ok(*b),
            serde_yaml::Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(mismatch(key, "bool")),
            },
            _ => Err(mismatch(key, "bool")),
        }
    }
}

impl FromValue for Duration {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        match value {
            // Bare integers are seconds.
            serde_yaml::Value::Number(n) => n
                .as_u64()
                .map(Duration::from_secs)
                .ok_or_else(|| mismatch(key, "duration")),
            serde_yaml::Value::String(s) => {
                parse_duration(s).ok_or_else(|| mismatch(key, "duration"))
            }
            _ => Err(mismatch(key, "duration")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        match value {
            serde_yaml::Value::Null => Ok(None),
            v => T::from_value(v, key).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &serde_yaml::Value, key: &str) -> Result<Self, ConfigError> {
        match value {
            serde_yaml::Value::Sequence(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| T::from_value(v, &format!("{key}[{i}]")))
                .collect(),
            other => Ok(vec![T::from_value(other, key)?]),
        }
    }
}

/// Parse a duration literal such as `250ms`, `30s`, `5m`, `2h` or `1d`.
///
/// A bare number is taken as seconds. Returns `None` on malformed input.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = s.split_at(split);
    let num: u64 = num.parse().ok()?;
    match unit.trim() {
        "ms" => Some(Duration::from_millis(num)),
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        "d" => Some(Duration::from_secs(num * 86400)),
        _ => None,
    }
}
