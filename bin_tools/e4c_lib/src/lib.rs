use log::info;
use std::sync::Once;

pub mod config;
pub mod constants;
pub mod error;
pub mod extractor;
pub mod low_level_tools;
pub mod routines;
pub mod system_tools;
pub mod test_utils;

pub use config::{InjectorConfig, LoggingConfig};
pub use error::{ConfigError, ExtractError, InjectError, InjectionResult};
pub use extractor::{CodeBlob, SymbolPair};
pub use low_level_tools::{Injector, LocalProcess, TargetProcess, WaitOutcome, inject_and_run};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use low_level_tools::TracedProcess;

static INIT: Once = Once::new();

fn build_logger(config: &LoggingConfig) -> Result<(), ConfigError> {
    let appender = log4rs::append::file::FileAppender::builder()
        .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
            &config.pattern,
        )))
        .build(&config.file)
        .map_err(|e| ConfigError::Logger(e.to_string()))?;

    let log_config = log4rs::config::Config::builder()
        .appender(log4rs::config::Appender::builder().build("file", Box::new(appender)))
        .build(
            log4rs::config::Root::builder()
                .appender("file")
                .build(config.level_filter()),
        )
        .map_err(|e| ConfigError::Logger(e.to_string()))?;

    log4rs::init_config(log_config).map_err(|e| ConfigError::Logger(e.to_string()))?;
    Ok(())
}

/// Installs the file logger once per process. Later calls are no-ops and
/// report success; a failed first attempt is reported and not retried.
pub fn initialize_logger(config: &LoggingConfig) -> Result<(), ConfigError> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = build_logger(config);
        if result.is_ok() {
            info!("e4c_lib logger initialized, writing to {}", config.file);
        }
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_logger_once() {
        let config = LoggingConfig {
            file: std::env::temp_dir()
                .join("e4c_lib_test.log")
                .to_string_lossy()
                .into_owned(),
            ..LoggingConfig::default()
        };
        assert!(initialize_logger(&config).is_ok());
        assert!(initialize_logger(&config).is_ok());
    }
}
