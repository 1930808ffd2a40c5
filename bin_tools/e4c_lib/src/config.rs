use log::{LevelFilter, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, DEFAULT_TERMINATE_GRACE_MS, LOG_FILE_PATH, LOG_LEVEL,
    LOG_PATTERN,
};
use crate::error::ConfigError;

/// Injector settings, usually loaded from `~/.config/e4c/injector.yaml`
///
/// ```yaml
/// wait_timeout_ms: 5000
/// terminate_grace_ms: 500
/// verify_layout: true
/// logging:
///   file: /tmp/e4c_lib.log
///   level: debug
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct InjectorConfig {
    /// Bound on the wait for the remote thread; absent means wait forever
    pub wait_timeout_ms: Option<u64>,
    /// How long a timed out remote thread gets to acknowledge termination
    pub terminate_grace_ms: u64,
    /// Check that a blob sits inside an executable mapping before injecting it
    pub verify_layout: bool,
    /// File logging through log4rs; absent leaves logging to the binary
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: String,
    pub level: String,
    pub pattern: String,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        InjectorConfig {
            wait_timeout_ms: None,
            terminate_grace_ms: DEFAULT_TERMINATE_GRACE_MS,
            verify_layout: true,
            logging: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            file: LOG_FILE_PATH.to_string(),
            level: LOG_LEVEL.to_string(),
            pattern: LOG_PATTERN.to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> LevelFilter {
        match LevelFilter::from_str(&self.level) {
            Ok(level) => level,
            Err(_) => {
                warn!("Unknown log level '{}', using info", self.level);
                LevelFilter::Info
            }
        }
    }
}

/// Returns the config path, honoring `E4C_CONFIG` and expanding `~`
pub fn get_config_path() -> String {
    let raw = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    shellexpand::tilde(&raw).into_owned()
}

impl InjectorConfig {
    /// Loads the config from [`get_config_path`]. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = get_config_path();
        if !Path::new(&path).exists() {
            info!("No config at {}, using defaults", path);
            return Ok(InjectorConfig::default());
        }
        Self::from_path(&path)
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let yaml_content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config = Self::from_yaml_str(&yaml_content)?;
        info!("Loaded injector config from {}", path);
        Ok(config)
    }

    pub fn from_yaml_str(yaml_content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str::<InjectorConfig>(yaml_content)?)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_wait_forever() {
        let config = InjectorConfig::default();
        assert_eq!(config.wait_timeout(), None);
        assert_eq!(
            config.terminate_grace(),
            Duration::from_millis(DEFAULT_TERMINATE_GRACE_MS)
        );
        assert!(config.verify_layout);
        assert_eq!(config.logging, None);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = InjectorConfig::from_yaml_str("wait_timeout_ms: 250\n").unwrap();
        assert_eq!(config.wait_timeout(), Some(Duration::from_millis(250)));
        assert!(config.verify_layout);
        assert_eq!(config.logging, None);
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
wait_timeout_ms: 1000
terminate_grace_ms: 20
verify_layout: false
logging:
  file: /tmp/other.log
  level: debug
"#;
        let config = InjectorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.wait_timeout_ms, Some(1000));
        assert_eq!(config.terminate_grace(), Duration::from_millis(20));
        assert!(!config.verify_layout);
        let logging = config.logging.unwrap();
        assert_eq!(logging.file, "/tmp/other.log");
        assert_eq!(logging.level_filter(), LevelFilter::Debug);
        assert_eq!(logging.pattern, LOG_PATTERN);
    }

    #[test]
    fn test_empty_logging_section_uses_defaults() {
        let config = InjectorConfig::from_yaml_str("logging: {}\n").unwrap();
        let logging = config.logging.unwrap();
        assert_eq!(logging.file, LOG_FILE_PATH);
        assert_eq!(logging.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let result = InjectorConfig::from_yaml_str("wait_timeout_ms: [not, a, number]");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let logging = LoggingConfig {
            level: "chatty".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(logging.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn test_from_path() {
        let path = std::env::temp_dir().join(format!("e4c_config_{}.yaml", std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "terminate_grace_ms: 7").unwrap();

        let config = InjectorConfig::from_path(path.to_str().unwrap()).unwrap();
        assert_eq!(config.terminate_grace_ms, 7);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_path_is_read_error() {
        let result = InjectorConfig::from_path("/nonexistent/e4c/injector.yaml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
