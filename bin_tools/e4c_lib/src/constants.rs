// Constants used across the e4c_lib crate

// Logging
pub const LOG_FILE_PATH: &str = "/tmp/e4c_lib.log";
pub const LOG_PATTERN: &str = "{d} [{l}] {t}: {m}{n}";
pub const LOG_LEVEL: &str = "info";

// Configuration
pub const CONFIG_PATH_ENV: &str = "E4C_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/e4c/injector.yaml";

// Injection
pub const DEFAULT_TERMINATE_GRACE_MS: u64 = 500;
pub const WAIT_POLL_INTERVAL_MS: u64 = 2;

// Suffix of the sentinel symbol that follows an exported routine
pub const END_MARKER_SUFFIX: &str = "_end";
