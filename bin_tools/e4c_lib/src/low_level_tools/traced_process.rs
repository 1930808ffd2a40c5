// Injection into a separate process through ptrace (Linux x86_64).
//
// The four primitives are emulated on the tracee's stopped main thread:
// memory management runs as remote syscalls through a temporarily planted
// `syscall; int3`, and the injected routine runs on the hijacked thread with
// a return address pointing at that `int3`.

use libc::{c_int, c_long, c_void, pid_t, user_regs_struct};
use log::{debug, error, info, warn};
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use std::{io, mem, ptr};

use super::process::{TargetProcess, WaitOutcome, page_aligned};
use crate::constants::WAIT_POLL_INTERVAL_MS;
use crate::system_tools::write_process_memory;

// syscall; int3
const SYSCALL_TRAP: [u8; 3] = [0x0f, 0x05, 0xcc];
const INT3_OFFSET: u64 = 2;
const RED_ZONE: u64 = 128;

/// A process attached with `PTRACE_ATTACH`.
///
/// ptrace requests are only accepted from the attaching thread, so the handle
/// is neither `Send` nor `Sync`. Dropping it restores the registers captured
/// at attach time and detaches.
pub struct TracedProcess {
    pid: pid_t,
    original: user_regs_struct,
    gadget: u64,
    _not_send: PhantomData<*const ()>,
}

/// Execution of injected code on the hijacked tracee thread
#[derive(Debug)]
pub struct TracedThread {
    return_trap: u64,
    saved_code: u64,
    stack_slot: u64,
    saved_stack: u64,
    stopped: bool,
    exit_code: Option<u32>,
    closed: bool,
}

fn ptrace_result(ret: c_long) -> io::Result<c_long> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn ptrace_attach(pid: pid_t) -> io::Result<()> {
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_ATTACH,
            pid,
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    })
    .map(|_| ())
}

fn ptrace_detach(pid: pid_t) -> io::Result<()> {
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_DETACH,
            pid,
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    })
    .map(|_| ())
}

fn ptrace_cont(pid: pid_t, signal: c_int) -> io::Result<()> {
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_CONT,
            pid,
            ptr::null_mut::<c_void>(),
            signal as usize as *mut c_void,
        )
    })
    .map(|_| ())
}

fn get_regs(pid: pid_t) -> io::Result<user_regs_struct> {
    let mut regs: user_regs_struct = unsafe { mem::zeroed() };
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGS,
            pid,
            ptr::null_mut::<c_void>(),
            &mut regs as *mut user_regs_struct as *mut c_void,
        )
    })?;
    Ok(regs)
}

fn set_regs(pid: pid_t, regs: &user_regs_struct) -> io::Result<()> {
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGS,
            pid,
            ptr::null_mut::<c_void>(),
            regs as *const user_regs_struct as *mut c_void,
        )
    })
    .map(|_| ())
}

fn peek_word(pid: pid_t, address: u64) -> io::Result<u64> {
    // PEEKDATA returns the word itself, so -1 is only an error if errno says so
    unsafe { *libc::__errno_location() = 0 };
    let word = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKDATA,
            pid,
            address as *mut c_void,
            ptr::null_mut::<c_void>(),
        )
    };
    if word == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(0) {
            return Err(err);
        }
    }
    Ok(word as u64)
}

fn poke_word(pid: pid_t, address: u64, word: u64) -> io::Result<()> {
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_POKEDATA,
            pid,
            address as *mut c_void,
            word as *mut c_void,
        )
    })
    .map(|_| ())
}

/// Waits for the tracee to stop and returns the stop signal.
/// With `nohang`, returns `None` if it is still running.
fn wait_for_stop(pid: pid_t, nohang: bool) -> io::Result<Option<c_int>> {
    let flags = if nohang {
        libc::__WALL | libc::WNOHANG
    } else {
        libc::__WALL
    };

    loop {
        let mut status: c_int = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, flags) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(None);
        }
        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            error!("Tracee {} is gone (status 0x{:x})", pid, status);
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        if libc::WIFSTOPPED(status) {
            return Ok(Some(libc::WSTOPSIG(status)));
        }
    }
}

fn is_fault_signal(signal: c_int) -> bool {
    matches!(
        signal,
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGABRT
    )
}

fn patch_word(word: u64, bytes: &[u8]) -> u64 {
    let mut patched = word.to_ne_bytes();
    patched[..bytes.len()].copy_from_slice(bytes);
    u64::from_ne_bytes(patched)
}

impl TracedProcess {
    /// Attaches to `pid` and waits until it is stopped.
    pub fn attach(pid: u32) -> io::Result<Self> {
        let pid = pid as pid_t;
        ptrace_attach(pid)?;

        let original = match wait_for_stop(pid, false).and_then(|_| get_regs(pid)) {
            Ok(regs) => regs,
            Err(e) => {
                if let Err(detach_err) = ptrace_detach(pid) {
                    warn!("Failed to detach from {}: {}", pid, detach_err);
                }
                return Err(e);
            }
        };

        info!("Attached to process {} (rip 0x{:x})", pid, original.rip);
        Ok(TracedProcess {
            pid,
            original,
            gadget: original.rip,
            _not_send: PhantomData,
        })
    }

    /// Continues the tracee until it hits the planted `int3`
    fn run_until_trap(&self) -> io::Result<()> {
        ptrace_cont(self.pid, 0)?;
        loop {
            match wait_for_stop(self.pid, false)? {
                Some(libc::SIGTRAP) => return Ok(()),
                Some(signal) if is_fault_signal(signal) => {
                    return Err(io::Error::other(format!(
                        "tracee faulted with signal {} during remote syscall",
                        signal
                    )));
                }
                Some(signal) => {
                    debug!("Suppressing signal {} during remote syscall", signal);
                    ptrace_cont(self.pid, 0)?;
                }
                None => {}
            }
        }
    }

    /// Executes one syscall inside the tracee and returns its result
    fn remote_syscall(&self, number: c_long, args: [u64; 6]) -> io::Result<u64> {
        let mut regs = self.original;
        regs.rax = number as u64;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        regs.rip = self.gadget;
        // Keep the kernel from restarting whatever syscall the tracee was in
        regs.orig_rax = u64::MAX;

        let saved_code = peek_word(self.pid, self.gadget)?;
        poke_word(self.pid, self.gadget, patch_word(saved_code, &SYSCALL_TRAP))?;

        let outcome = set_regs(self.pid, &regs)
            .and_then(|_| self.run_until_trap())
            .and_then(|_| get_regs(self.pid));

        let restored_code = poke_word(self.pid, self.gadget, saved_code);
        let restored_regs = set_regs(self.pid, &self.original);

        let result = outcome?.rax as i64;
        restored_code?;
        restored_regs?;

        if (-4095..0).contains(&result) {
            return Err(io::Error::from_raw_os_error(-result as i32));
        }
        Ok(result as u64)
    }

    /// Puts back what spawning the routine changed
    fn restore_after_thread(&self, thread: &TracedThread) -> io::Result<()> {
        let stack = poke_word(self.pid, thread.stack_slot, thread.saved_stack);
        let code = poke_word(self.pid, self.gadget, thread.saved_code);
        let regs = set_regs(self.pid, &self.original);
        stack.and(code).and(regs)
    }
}

impl TargetProcess for TracedProcess {
    type Thread = TracedThread;

    fn pid(&self) -> u32 {
        self.pid as u32
    }

    fn allocate(&self, size: usize) -> io::Result<u64> {
        let aligned_size = page_aligned(size);
        let address = self.remote_syscall(
            libc::SYS_mmap,
            [
                0,
                aligned_size as u64,
                (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64,
                (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
                u64::MAX,
                0,
            ],
        )?;
        debug!(
            "Mapped {} bytes of RWX memory at 0x{:x} in {}",
            aligned_size, address, self.pid
        );
        Ok(address)
    }

    fn write(&self, address: u64, data: &[u8]) -> io::Result<()> {
        write_process_memory(self.pid, address, data)
    }

    fn flush_instruction_cache(&self, _address: u64, _size: usize) -> io::Result<()> {
        // The tracee shares this x86_64 CPU; its caches are coherent
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn spawn_thread(&self, entry: u64) -> io::Result<TracedThread> {
        let saved_code = peek_word(self.pid, self.gadget)?;
        let stack_slot = ((self.original.rsp - RED_ZONE) & !0xf) - 8;
        let saved_stack = peek_word(self.pid, stack_slot)?;

        let mut thread = TracedThread {
            return_trap: self.gadget + INT3_OFFSET,
            saved_code,
            stack_slot,
            saved_stack,
            stopped: true,
            exit_code: None,
            closed: false,
        };

        let mut regs = self.original;
        regs.rip = entry;
        regs.rsp = stack_slot;
        regs.rdi = 0;
        regs.rax = 0;
        regs.orig_rax = u64::MAX;

        let started = poke_word(self.pid, self.gadget, patch_word(saved_code, &SYSCALL_TRAP))
            .and_then(|_| poke_word(self.pid, stack_slot, thread.return_trap))
            .and_then(|_| set_regs(self.pid, &regs))
            .and_then(|_| ptrace_cont(self.pid, 0));

        if let Err(e) = started {
            if let Err(restore_err) = self.restore_after_thread(&thread) {
                error!("Failed to restore tracee {}: {}", self.pid, restore_err);
            }
            return Err(e);
        }

        thread.stopped = false;
        info!("Hijacked thread {} to run code at 0x{:x}", self.pid, entry);
        Ok(thread)
    }

    fn wait_thread(
        &self,
        thread: &mut TracedThread,
        timeout: Option<Duration>,
    ) -> io::Result<WaitOutcome> {
        if thread.stopped {
            return Ok(WaitOutcome::Exited);
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            match wait_for_stop(self.pid, deadline.is_some())? {
                None => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    std::thread::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS));
                }
                Some(libc::SIGTRAP) => {
                    thread.stopped = true;
                    let regs = get_regs(self.pid)?;
                    if regs.rip != thread.return_trap + 1 {
                        return Err(io::Error::other(format!(
                            "unexpected trap at 0x{:x}",
                            regs.rip
                        )));
                    }
                    thread.exit_code = Some(regs.rax as u32);
                    return Ok(WaitOutcome::Exited);
                }
                Some(signal) if is_fault_signal(signal) => {
                    thread.stopped = true;
                    return Err(io::Error::other(format!(
                        "injected code faulted with signal {}",
                        signal
                    )));
                }
                Some(libc::SIGSTOP) => ptrace_cont(self.pid, 0)?,
                Some(signal) => ptrace_cont(self.pid, signal)?,
            }
        }
    }

    fn exit_code(&self, thread: &TracedThread) -> io::Result<u32> {
        thread
            .exit_code
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn terminate_thread(&self, thread: &mut TracedThread, grace: Duration) -> io::Result<()> {
        if thread.stopped {
            return Ok(());
        }

        let rc = unsafe { libc::syscall(libc::SYS_tgkill, self.pid, self.pid, libc::SIGSTOP) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        let deadline = Instant::now() + grace;
        loop {
            match wait_for_stop(self.pid, true)? {
                Some(signal) if signal == libc::SIGSTOP || is_fault_signal(signal) => {
                    thread.stopped = true;
                    info!("Stopped injected code in {} (signal {})", self.pid, signal);
                    return Ok(());
                }
                Some(signal) => {
                    // Our SIGSTOP is still queued behind this one
                    debug!("Dropping signal {} while terminating", signal);
                    ptrace_cont(self.pid, 0)?;
                }
                None => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
                    }
                    std::thread::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS));
                }
            }
        }
    }

    fn close_thread(&self, thread: &mut TracedThread) -> io::Result<()> {
        if thread.closed {
            return Ok(());
        }
        thread.closed = true;

        if !thread.stopped {
            // Registers can't be restored under running code
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.restore_after_thread(thread)
    }

    fn free(&self, address: u64, size: usize) -> io::Result<()> {
        self.remote_syscall(
            libc::SYS_munmap,
            [address, page_aligned(size) as u64, 0, 0, 0, 0],
        )
        .map(|_| ())
    }
}

impl Drop for TracedProcess {
    fn drop(&mut self) {
        if let Err(e) = set_regs(self.pid, &self.original) {
            warn!("Failed to restore registers of {}: {}", self.pid, e);
        }
        match ptrace_detach(self.pid) {
            Ok(()) => info!("Detached from process {}", self.pid),
            Err(e) => error!("Failed to detach from {}: {}", self.pid, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_word_keeps_tail() {
        let word = u64::from_ne_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let patched = patch_word(word, &SYSCALL_TRAP);
        assert_eq!(
            patched.to_ne_bytes(),
            [0x0f, 0x05, 0xcc, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_fault_signals() {
        assert!(is_fault_signal(libc::SIGSEGV));
        assert!(is_fault_signal(libc::SIGILL));
        assert!(!is_fault_signal(libc::SIGSTOP));
        assert!(!is_fault_signal(libc::SIGCHLD));
    }

    #[test]
    fn test_attach_to_missing_process_fails() {
        // pid_max is far below this
        assert!(TracedProcess::attach(0x7fff_fff0).is_err());
    }
}
