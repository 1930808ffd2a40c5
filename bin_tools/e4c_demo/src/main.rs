use anyhow::Result;
use e4c_demo::{DEFAULT_ROUTINE, init_logging, inject_local, load_config, select_routine};
use log::{info, warn};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config();
    init_logging(&config)?;

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ROUTINE.to_string());
    let routine = select_routine(&name)?;

    info!(
        "Injecting '{}' ({} bytes) into process {}",
        routine.name,
        routine.blob.len(),
        std::process::id()
    );

    tokio::select! {
        result = inject_local(routine.blob, config) => {
            let exit_code = result?;
            println!("Remote thread returns: {}", exit_code);
            if let Some(expected) = routine.expected_exit_code {
                if expected != exit_code {
                    warn!("'{}' should have returned {}", routine.name, expected);
                }
            }
        }
        _ = signal::ctrl_c() => {
            warn!("Interrupted while waiting for the injected thread");
        }
    }

    Ok(())
}
