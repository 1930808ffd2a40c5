use anyhow::{Context, Result, anyhow};
use e4c_lib::routines::{Routine, routine, routine_names};
use e4c_lib::{CodeBlob, Injector, InjectorConfig, LocalProcess};
use log::{info, warn};

pub const DEFAULT_ROUTINE: &str = "inject_proc";

/// Loads the injector config, falling back to defaults if it is unusable
pub fn load_config() -> InjectorConfig {
    match InjectorConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring config: {}", e);
            InjectorConfig::default()
        }
    }
}

/// Sends logs to the config's log4rs file when it has a `logging` section,
/// otherwise to stderr through env_logger.
pub fn init_logging(config: &InjectorConfig) -> Result<()> {
    match &config.logging {
        Some(logging) => {
            e4c_lib::initialize_logger(logging).context("failed to set up file logging")?
        }
        None => env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .try_init()
            .context("failed to set up stderr logging")?,
    }
    Ok(())
}

pub fn select_routine(name: &str) -> Result<Routine> {
    routine(name).ok_or_else(|| {
        anyhow!(
            "unknown routine '{}', available: {}",
            name,
            routine_names().join(", ")
        )
    })
}

/// Injects `blob` into the current process without blocking the runtime.
///
/// The pipeline blocks until the injected thread finishes, so it runs on
/// tokio's blocking pool.
pub async fn inject_local(blob: CodeBlob, config: InjectorConfig) -> Result<u32> {
    if config.verify_layout {
        blob.verify_layout()?;
    }

    info!(
        "Injecting {} bytes from 0x{:x} into this process",
        blob.len(),
        blob.base()
    );
    let exit_code = tokio::task::spawn_blocking(move || {
        let process = LocalProcess::current();
        Injector::from_config(&process, &config).inject_and_run(&blob)
    })
    .await
    .context("injection task panicked")??;

    Ok(exit_code)
}
