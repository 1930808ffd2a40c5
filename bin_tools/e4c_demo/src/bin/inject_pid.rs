// Injects a built-in routine into another process through ptrace
use anyhow::{Result, anyhow};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn main() -> Result<()> {
    use anyhow::Context;
    use e4c_demo::{DEFAULT_ROUTINE, init_logging, load_config, select_routine};
    use e4c_lib::{Injector, TracedProcess};
    use log::info;

    let config = load_config();
    init_logging(&config)?;

    let mut args = std::env::args().skip(1);
    let pid: u32 = args
        .next()
        .ok_or_else(|| anyhow!("usage: inject_pid <pid> [routine]"))?
        .parse()
        .context("invalid pid")?;
    let name = args.next().unwrap_or_else(|| DEFAULT_ROUTINE.to_string());

    let routine = select_routine(&name)?;
    if config.verify_layout {
        routine.blob.verify_layout()?;
    }

    // Attach, inject and detach on this one thread: ptrace is per tracer thread
    let process =
        TracedProcess::attach(pid).with_context(|| format!("failed to attach to {}", pid))?;
    info!("Injecting '{}' into process {}", routine.name, pid);
    let exit_code = Injector::from_config(&process, &config).inject_and_run(&routine.blob)?;
    drop(process);

    println!("Remote thread returns: {}", exit_code);
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn main() -> Result<()> {
    Err(anyhow!("ptrace injection is only supported on Linux x86_64"))
}
