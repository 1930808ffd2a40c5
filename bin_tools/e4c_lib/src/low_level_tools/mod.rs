// Low level tools: process primitives and the injection pipeline built on them

pub mod cache;
pub mod injector;
pub mod local_process;
pub mod process;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod traced_process;

pub use injector::{Injector, inject_and_run};
pub use local_process::{LocalProcess, LocalThread};
pub use process::{TargetProcess, WaitOutcome};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use traced_process::{TracedProcess, TracedThread};
