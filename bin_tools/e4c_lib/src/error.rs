use std::io;
use std::time::Duration;

use thiserror::Error as ThisError;

/// Failure of one injection attempt, tagged with the stage that failed.
///
/// Every variant raised after a resource was acquired is returned only once
/// that resource has been released again, except [`InjectError::TerminateFailed`]
/// where the allocation is deliberately left mapped under a live thread.
#[derive(ThisError, Debug)]
pub enum InjectError {
    #[error("refusing to inject an empty code blob")]
    EmptyBlob,

    #[error("remote allocation failed: {0}")]
    AllocationFailed(#[source] io::Error),

    #[error("writing code into remote memory failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("instruction cache synchronization failed: {0}")]
    SyncFailed(#[source] io::Error),

    #[error("creating remote thread failed: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("remote thread result unavailable: {0}")]
    ResultUnavailable(#[source] io::Error),

    #[error("remote thread did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("remote thread could not be terminated, allocation at 0x{address:x} left mapped: {source}")]
    TerminateFailed {
        address: u64,
        #[source]
        source: io::Error,
    },
}

impl InjectError {
    /// Underlying platform error, if the failing stage reported one.
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            InjectError::AllocationFailed(e)
            | InjectError::WriteFailed(e)
            | InjectError::SyncFailed(e)
            | InjectError::SpawnFailed(e)
            | InjectError::ResultUnavailable(e) => Some(e),
            InjectError::TerminateFailed { source, .. } => Some(source),
            InjectError::EmptyBlob | InjectError::TimedOut(_) => None,
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        self.os_error().and_then(io::Error::raw_os_error)
    }
}

/// Outcome of one injection attempt: the remote thread's 32-bit exit code.
pub type InjectionResult = Result<u32, InjectError>;

#[derive(ThisError, Debug)]
pub enum ExtractError {
    #[error("failed to open image {image}: {source}")]
    ImageOpen {
        image: String,
        #[source]
        source: dlopen::Error,
    },

    #[error("symbol {name} not found: {source}")]
    SymbolNotFound {
        name: String,
        #[source]
        source: dlopen::Error,
    },

    #[error("code range 0x{address:x}+{len} is not inside one executable mapping")]
    LayoutNotExecutable { address: u64, len: usize },
}

#[derive(ThisError, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to initialize logger: {0}")]
    Logger(String),
}
