//! Configuration parsing module
//!
//! Reads a JSON5 file, substitutes `${VAR}` environment references in string
//! values and deserializes the result into [`Config`]. Every field has a
//! default, so a missing file or a partial file is valid.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "WRPHUB_CONFIG_PATH";

const DEFAULT_CONFIG_FILE: &str = "wrphub.json5";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid config at {path}: {message}")]
    InvalidShape { path: String, message: String },

    #[error("Validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub server: ServerSection,
    pub device: DeviceConfig,
    pub logging: LoggingSection,
    pub retry: RetrySection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSection {
    /// Listen address, `host:port`.
    pub address: String,
    /// Largest accepted HTTP request body.
    pub max_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:6100".to_string(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Device hub tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    /// 0 means unbounded.
    pub max_devices: usize,
    pub device_message_queue_size: usize,
    pub ping_period_ms: u64,
    pub idle_period_ms: u64,
    pub write_timeout_ms: u64,
    pub auth_delay_ms: u64,
    pub default_route_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_devices: 0,
            device_message_queue_size: 100,
            ping_period_ms: 45_000,
            idle_period_ms: 135_000,
            write_timeout_ms: 60_000,
            auth_delay_ms: 1_000,
            default_route_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSection {
    pub level: String,
    /// `plaintext` or `json`
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plaintext".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySection {
    /// Extra attempts after the first; 0 or less disables retrying.
    pub retries: i32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self { retries: 1 }
    }
}

/// Get the config file path.
/// Priority: WRPHUB_CONFIG_PATH > ./wrphub.json5
pub fn get_config_path() -> PathBuf {
    match env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

/// Load the config from the default location.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load, substitute and validate the config at `path`.
/// Returns defaults if the file doesn't exist.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::debug!(target: "config", path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let config = parse_config(&content, path)?;
    tracing::info!(target: "config", path = %path.display(), "loaded config");
    Ok(config)
}

/// Parse config text. `path` is only used in error messages.
pub fn parse_config(content: &str, path: &Path) -> Result<Config, ConfigError> {
    let mut value = parse_json5(content, path)?;
    substitute_env_vars(&mut value)?;

    let config: Config =
        serde_json::from_value(value).map_err(|e| ConfigError::InvalidShape {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    validate(&config)?;
    Ok(config)
}

fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in string values.
/// Pattern: ${VAR} where VAR matches [A-Z_][A-Z0-9_]*
/// Escape with $${VAR} to get literal ${VAR}
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid")
    });

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        result.push_str(&s[last_end..full.start()]);

        if full.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", name.as_str()));
        } else {
            let value = env::var(name.as_str()).map_err(|_| ConfigError::MissingEnvVar {
                var: name.as_str().to_string(),
            })?;
            result.push_str(&value);
        }
        last_end = full.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

fn invalid(path: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        path: path.to_string(),
        message: message.to_string(),
    }
}

/// Reject values the hub cannot run with.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.address.parse::<std::net::SocketAddr>().is_err() {
        return Err(invalid("server.address", "must be a socket address such as 0.0.0.0:6100"));
    }
    let device = &config.device;
    if device.device_message_queue_size == 0 {
        return Err(invalid("device.deviceMessageQueueSize", "must be at least 1"));
    }
    for (path, value) in [
        ("device.pingPeriodMs", device.ping_period_ms),
        ("device.idlePeriodMs", device.idle_period_ms),
        ("device.writeTimeoutMs", device.write_timeout_ms),
        ("device.defaultRouteTimeoutMs", device.default_route_timeout_ms),
    ] {
        if value == 0 {
            return Err(invalid(path, "must be greater than zero"));
        }
    }
    if device.idle_period_ms <= device.ping_period_ms {
        return Err(invalid("device.idlePeriodMs", "must be longer than pingPeriodMs"));
    }
    if !matches!(config.logging.format.as_str(), "plaintext" | "json") {
        return Err(invalid("logging.format", "must be \"plaintext\" or \"json\""));
    }
    if config.logging.level.parse::<tracing::Level>().is_err() {
        return Err(invalid("logging.level", "must be trace, debug, info, warn or error"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn create_temp_config(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config_from(Path::new("/nonexistent/wrphub.json5")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.device.device_message_queue_size, 100);
        assert_eq!(config.device.ping_period_ms, 45_000);
        assert_eq!(config.server.address, "0.0.0.0:6100");
        assert_eq!(config.retry.retries, 1);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = create_temp_config(
            &dir,
            "wrphub.json5",
            r#"{
                // comments are fine
                device: { maxDevices: 500, },
                logging: { format: "json" },
            }"#,
        );
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.device.max_devices, 500);
        assert_eq!(config.device.write_timeout_ms, 60_000);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_error() {
        let result = parse_config("{ invalid json }", Path::new("test.json5"));
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_wrong_type_is_invalid_shape() {
        let result = parse_config(r#"{ device: { maxDevices: "many" } }"#, Path::new("t"));
        assert!(matches!(result, Err(ConfigError::InvalidShape { .. })));
    }

    #[test]
    fn test_env_var_substitution() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var("WRPHUB_TEST_ADDR", "127.0.0.1:7000");

        let config =
            parse_config(r#"{ server: { address: "${WRPHUB_TEST_ADDR}" } }"#, Path::new("t"))
                .unwrap();
        assert_eq!(config.server.address, "127.0.0.1:7000");

        env::remove_var("WRPHUB_TEST_ADDR");
    }

    #[test]
    fn test_env_var_escaped() {
        let result = substitute_env_in_string("$${ESCAPED_VAR}").unwrap();
        assert_eq!(result, "${ESCAPED_VAR}");
    }

    #[test]
    fn test_env_var_missing() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var("NONEXISTENT_VAR_12345");
        let result = substitute_env_in_string("x-${NONEXISTENT_VAR_12345}");

        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar { var }) if var == "NONEXISTENT_VAR_12345")
        );
    }

    #[test]
    fn test_validation_rejects_zero_queue() {
        let mut config = Config::default();
        config.device.device_message_queue_size = 0;
        assert!(matches!(
            validate(&config),
            Err(ConfigError::ValidationError { path, .. }) if path == "device.deviceMessageQueueSize"
        ));
    }

    #[test]
    fn test_validation_rejects_idle_shorter_than_ping() {
        let mut config = Config::default();
        config.device.idle_period_ms = 1_000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_get_config_path() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var(CONFIG_PATH_ENV);
        assert_eq!(get_config_path(), PathBuf::from("wrphub.json5"));

        env::set_var(CONFIG_PATH_ENV, "/etc/wrphub/hub.json5");
        assert_eq!(get_config_path(), PathBuf::from("/etc/wrphub/hub.json5"));
        env::remove_var(CONFIG_PATH_ENV);
    }
}
