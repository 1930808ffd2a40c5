// Instruction cache maintenance for freshly written code

use std::io;

/// Makes `[address, address + size)` of the current process safe to execute
/// after it was written through the data side.
///
/// x86 keeps instruction and data caches coherent, so only a fence is needed.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn flush_instruction_cache(_address: u64, _size: usize) -> io::Result<()> {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    Ok(())
}

#[cfg(target_arch = "aarch64")]
pub fn flush_instruction_cache(address: u64, size: usize) -> io::Result<()> {
    use std::arch::asm;

    let start = address as usize;
    let end = start
        .checked_add(size)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

    let ctr: u64;
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr) };
    let dcache_line = 4usize << ((ctr >> 16) & 0xf);
    let icache_line = 4usize << (ctr & 0xf);

    unsafe {
        let mut line = start & !(dcache_line - 1);
        while line < end {
            asm!("dc cvau, {}", in(reg) line);
            line += dcache_line;
        }
        asm!("dsb ish");

        let mut line = start & !(icache_line - 1);
        while line < end {
            asm!("ic ivau, {}", in(reg) line);
            line += icache_line;
        }
        asm!("dsb ish", "isb");
    }

    Ok(())
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
pub fn flush_instruction_cache(_address: u64, _size: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "instruction cache flush not implemented for this architecture",
    ))
}
