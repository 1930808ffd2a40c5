use libc::{iovec, pid_t, process_vm_readv, process_vm_writev};
use log::{debug, error};
use std::io;

/// Reads `size` bytes at `address` in process `pid`.
///
/// `process_vm_readv` never faults the caller, so reading an unmapped
/// address (even in our own process) reports `EFAULT` instead of crashing.
pub fn read_process_memory(pid: pid_t, address: u64, size: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; size];

    let local_iov = iovec {
        iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
        iov_len: size,
    };
    let remote_iov = iovec {
        iov_base: address as *mut libc::c_void,
        iov_len: size,
    };

    let result = unsafe { process_vm_readv(pid, &local_iov, 1, &remote_iov, 1, 0) };

    if result == -1 {
        let err = io::Error::last_os_error();
        error!("Failed to read memory of {} at 0x{:x}: {}", pid, address, err);
        return Err(err);
    }

    if result as usize != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "partial read from 0x{:x}: requested {} bytes, got {}",
                address, size, result
            ),
        ));
    }

    debug!("Read {} bytes from {}:0x{:x}", result, pid, address);
    Ok(buffer)
}

/// Writes `data` at `address` in process `pid`.
///
/// Honors page protections of the target: the destination must be writable.
pub fn write_process_memory(pid: pid_t, address: u64, data: &[u8]) -> io::Result<()> {
    let size = data.len();

    let local_iov = iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: size,
    };
    let remote_iov = iovec {
        iov_base: address as *mut libc::c_void,
        iov_len: size,
    };

    let result = unsafe { process_vm_writev(pid, &local_iov, 1, &remote_iov, 1, 0) };

    if result == -1 {
        let err = io::Error::last_os_error();
        error!("Failed to write memory of {} at 0x{:x}: {}", pid, address, err);
        return Err(err);
    }

    if result as usize != size {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!(
                "partial write to 0x{:x}: requested {} bytes, wrote {}",
                address, size, result
            ),
        ));
    }

    // Make the write visible before anything executes it
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);

    debug!("Wrote {} bytes to {}:0x{:x}", result, pid, address);
    Ok(())
}
