use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use logscope_protocol::event::LogLevel;

use crate::errors::ConfigError;

/// Default in-memory retention cap.
pub const DEFAULT_MAX_LOGS: usize = 1000;
/// Default cap on the spans map.
pub const DEFAULT_MAX_SPANS: usize = 1000;
/// Default quiet period before a persistence write.
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);
/// Default number of events mirrored to durable storage.
pub const DEFAULT_PERSIST_MAX: usize = 500;

/// Runtime environment used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }

    /// Minimum level used when none is configured explicitly.
    pub fn default_min_level(self) -> LogLevel {
        match self {
            Environment::Production => LogLevel::Info,
            Environment::Development | Environment::Staging => LogLevel::Debug,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

/// Settings for a store and its persistence bridge, as loaded from the
/// environment.
#[derive(Debug, Clone, PartialEq)]
pub struct LogScopeConfig {
    pub environment: Environment,
    pub max_logs: usize,
    pub min_level: LogLevel,
    pub enabled: bool,
    pub max_spans: usize,
    pub persist_debounce: Duration,
    pub persist_max: usize,
    pub data_dir: Option<PathBuf>,
}

impl Default for LogScopeConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            max_logs: DEFAULT_MAX_LOGS,
            min_level: LogLevel::Debug,
            enabled: true,
            max_spans: DEFAULT_MAX_SPANS,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
            persist_max: DEFAULT_PERSIST_MAX,
            data_dir: None,
        }
    }
}

impl LogScopeConfig {
    /// Loads configuration from `LOGSCOPE_*` variables (after reading `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_with_prefix("LOGSCOPE_")
    }

    /// Loads configuration from env vars prefixed with the provided value
    /// (e.g. `CHECKOUT_LOGSCOPE_`). Unset variables fall back to defaults;
    /// set but unparseable ones are errors.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        let key = |suffix: &str| format!("{}{}", prefix, suffix);

        let environment = env::var(key("ENV"))
            .map(|raw| Environment::from_str(&raw))
            .unwrap_or_default();

        let min_level = read_parsed::<LogLevel>(&key("MIN_LEVEL"))?
            .unwrap_or_else(|| environment.default_min_level());
        let max_logs = read_parsed(&key("MAX_LOGS"))?.unwrap_or(DEFAULT_MAX_LOGS);
        let max_spans = read_parsed(&key("MAX_SPANS"))?.unwrap_or(DEFAULT_MAX_SPANS);
        let enabled = read_bool(&key("ENABLED"))?.unwrap_or(true);
        let persist_debounce = read_parsed::<u64>(&key("PERSIST_DEBOUNCE_MS"))?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PERSIST_DEBOUNCE);
        let persist_max = read_parsed(&key("PERSIST_MAX"))?.unwrap_or(DEFAULT_PERSIST_MAX);
        let data_dir = env::var(key("DATA_DIR")).ok().map(PathBuf::from);

        Ok(Self {
            environment,
            max_logs,
            min_level,
            enabled,
            max_spans,
            persist_debounce,
            persist_max,
            data_dir,
        })
    }

    /// Whether the process is running in production.
    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }

    /// Directory for file-backed persistence, `~/.logscope/data` unless
    /// overridden.
    pub fn resolve_data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".logscope").join("data"))
            .ok_or(ConfigError::NoDataDir)
    }
}

fn read_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: err.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn read_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
                reason: "expected a boolean".into(),
            }),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own prefix so parallel tests never share variables.

    #[test]
    fn unset_variables_use_defaults() {
        let cfg = LogScopeConfig::from_env_with_prefix("LSTEST_DEFAULTS_").expect("config");
        assert_eq!(cfg, LogScopeConfig::default());
    }

    #[test]
    fn production_raises_the_default_level() {
        std::env::set_var("LSTEST_PROD_ENV", "prod");
        let cfg = LogScopeConfig::from_env_with_prefix("LSTEST_PROD_").expect("config");
        assert!(cfg.is_production());
        assert_eq!(cfg.min_level, LogLevel::Info);
    }

    #[test]
    fn reads_numeric_and_boolean_values() {
        std::env::set_var("LSTEST_VALUES_MAX_LOGS", "25");
        std::env::set_var("LSTEST_VALUES_ENABLED", "off");
        std::env::set_var("LSTEST_VALUES_PERSIST_DEBOUNCE_MS", "40");
        std::env::set_var("LSTEST_VALUES_MIN_LEVEL", "warn");
        let cfg = LogScopeConfig::from_env_with_prefix("LSTEST_VALUES_").expect("config");

        assert_eq!(cfg.max_logs, 25);
        assert!(!cfg.enabled);
        assert_eq!(cfg.persist_debounce, Duration::from_millis(40));
        assert_eq!(cfg.min_level, LogLevel::Warn);
    }

    #[test]
    fn rejects_unparseable_values() {
        std::env::set_var("LSTEST_BAD_MAX_LOGS", "lots");
        let err = LogScopeConfig::from_env_with_prefix("LSTEST_BAD_").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LSTEST_BAD_MAX_LOGS"));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let cfg = LogScopeConfig {
            data_dir: Some(PathBuf::from("/tmp/logscope-test")),
            ..LogScopeConfig::default()
        };
        assert_eq!(
            cfg.resolve_data_dir().unwrap(),
            PathBuf::from("/tmp/logscope-test")
        );
    }
}
