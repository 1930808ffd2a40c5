// Prints where each built-in routine lives and how big it is
use anyhow::Result;
use e4c_demo::{init_logging, load_config};
use e4c_lib::SymbolPair;
use e4c_lib::routines::{routine, routine_names};
use e4c_lib::system_tools::MemoryMap;

fn main() -> Result<()> {
    init_logging(&load_config())?;
    let map = MemoryMap::current()?;

    for name in routine_names() {
        let Some(routine) = routine(name) else {
            continue;
        };
        println!(
            "{:<14} address: 0x{:x}, size: {} bytes",
            routine.name,
            routine.blob.base(),
            routine.blob.len()
        );
        match map.find_containing(routine.blob.base()) {
            Some(entry) => println!(
                "{:<14} in {} 0x{:x}-0x{:x} {}",
                "",
                entry.get_perms(),
                entry.get_address(),
                entry.end_address(),
                entry.get_pathname()
            ),
            None => println!("{:<14} not in any mapping", ""),
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    println!("2 + 3 = {}", e4c_lib::routines::example_proc(2, 3));

    // Exported symbol lookup only sees the routines when linked with -rdynamic
    match unsafe { SymbolPair::for_routine("e4c_inject_proc").resolve_in_self() } {
        Ok(blob) => println!(
            "[symbol pair] e4c_inject_proc address: 0x{:x}, size: {} bytes",
            blob.base(),
            blob.len()
        ),
        Err(e) => println!("[symbol pair] not exported: {}", e),
    }

    Ok(())
}
