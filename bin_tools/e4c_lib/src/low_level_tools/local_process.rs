use libc::{c_int, c_void, pid_t, pthread_t};
use log::{debug, error, info, warn};
use std::sync::Once;
use std::time::Duration;
use std::{io, mem, ptr};

use super::cache;
use super::process::{TargetProcess, WaitOutcome, page_aligned};
use crate::system_tools::write_process_memory;

type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

/// The calling process used as injection target.
///
/// Code runs on a fresh native thread whose start routine is the injected
/// blob itself.
#[derive(Debug, Clone, Copy)]
pub struct LocalProcess {
    pid: pid_t,
}

#[derive(Debug)]
pub struct LocalThread {
    id: pthread_t,
    result: Option<usize>,
    joined: bool,
    closed: bool,
}

impl LocalProcess {
    pub fn current() -> Self {
        LocalProcess {
            pid: std::process::id() as pid_t,
        }
    }
}

static STOP_HANDLER: Once = Once::new();

/// Real-time signal that makes an injected local thread exit
fn stop_signal() -> c_int {
    libc::SIGRTMAX() - 1
}

// Injected code never reaches a cancellation point, so threads are stopped
// from a signal handler instead. pthread_exit unwinds through this frame.
extern "C-unwind" fn exit_on_stop_signal(_signal: c_int) {
    unsafe { libc::pthread_exit(ptr::null_mut()) }
}

fn install_stop_handler() -> io::Result<()> {
    let mut result = Ok(());
    STOP_HANDLER.call_once(|| {
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = exit_on_stop_signal as extern "C-unwind" fn(c_int) as libc::sighandler_t;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };

        if unsafe { libc::sigaction(stop_signal(), &action, ptr::null_mut()) } != 0 {
            result = Err(io::Error::last_os_error());
            error!("Failed to install thread stop handler: {:?}", result);
        } else {
            debug!("Installed thread stop handler for signal {}", stop_signal());
        }
    });
    result
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now, as pthread expects
fn realtime_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut deadline: libc::timespec = unsafe { mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let nanos = deadline.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    deadline.tv_sec += (timeout.as_secs() + nanos / 1_000_000_000) as libc::time_t;
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;
    Ok(deadline)
}

fn join(thread: &mut LocalThread, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
    let mut retval: *mut c_void = ptr::null_mut();
    let rc = match timeout {
        None => unsafe { libc::pthread_join(thread.id, &mut retval) },
        Some(timeout) => {
            let deadline = realtime_deadline(timeout)?;
            unsafe { libc::pthread_timedjoin_np(thread.id, &mut retval, &deadline) }
        }
    };

    match rc {
        0 => {
            thread.joined = true;
            thread.result = Some(retval as usize);
            Ok(WaitOutcome::Exited)
        }
        libc::ETIMEDOUT => Ok(WaitOutcome::TimedOut),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

impl TargetProcess for LocalProcess {
    type Thread = LocalThread;

    fn pid(&self) -> u32 {
        self.pid as u32
    }

    fn allocate(&self, size: usize) -> io::Result<u64> {
        let aligned_size = page_aligned(size);
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        debug!("Mapped {} bytes of RWX memory at {:p}", aligned_size, addr);
        Ok(addr as u64)
    }

    fn write(&self, address: u64, data: &[u8]) -> io::Result<()> {
        write_process_memory(self.pid, address, data)
    }

    fn flush_instruction_cache(&self, address: u64, size: usize) -> io::Result<()> {
        cache::flush_instruction_cache(address, size)
    }

    fn spawn_thread(&self, entry: u64) -> io::Result<LocalThread> {
        if entry == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        // The blob is shaped like a thread start routine: one ignored
        // argument, result in the return register.
        let start = unsafe { mem::transmute::<usize, StartRoutine>(entry as usize) };

        // The new thread inherits the signal mask, and it must accept the stop
        // signal even when the caller blocks it.
        let mut unblock: libc::sigset_t = unsafe { mem::zeroed() };
        let mut previous: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut unblock);
            libc::sigaddset(&mut unblock, stop_signal());
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &unblock, &mut previous);
        }

        let mut id: pthread_t = unsafe { mem::zeroed() };
        let rc = unsafe { libc::pthread_create(&mut id, ptr::null(), start, ptr::null_mut()) };
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &previous, ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }

        info!("Started local thread at 0x{:x}", entry);
        Ok(LocalThread {
            id,
            result: None,
            joined: false,
            closed: false,
        })
    }

    fn wait_thread(
        &self,
        thread: &mut LocalThread,
        timeout: Option<Duration>,
    ) -> io::Result<WaitOutcome> {
        if thread.joined {
            return Ok(WaitOutcome::Exited);
        }
        join(thread, timeout)
    }

    fn exit_code(&self, thread: &LocalThread) -> io::Result<u32> {
        match thread.result {
            // Thread start routines return a pointer; the code lives in its low half
            Some(value) => Ok(value as u32),
            None => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn terminate_thread(&self, thread: &mut LocalThread, grace: Duration) -> io::Result<()> {
        if thread.joined {
            return Ok(());
        }

        install_stop_handler()?;
        let rc = unsafe { libc::pthread_kill(thread.id, stop_signal()) };
        // ESRCH: the thread finished on its own and only needs joining
        if rc != 0 && rc != libc::ESRCH {
            return Err(io::Error::from_raw_os_error(rc));
        }

        match join(thread, Some(grace))? {
            WaitOutcome::Exited => {
                thread.result = None;
                Ok(())
            }
            WaitOutcome::TimedOut => {
                warn!("Local thread ignored stop signal for {:?}", grace);
                Err(io::Error::from_raw_os_error(libc::ETIMEDOUT))
            }
        }
    }

    fn close_thread(&self, thread: &mut LocalThread) -> io::Result<()> {
        if thread.closed {
            return Ok(());
        }
        thread.closed = true;

        if !thread.joined {
            let rc = unsafe { libc::pthread_detach(thread.id) };
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
        }
        Ok(())
    }

    fn free(&self, address: u64, size: usize) -> io::Result<()> {
        if address == 0 {
            return Ok(());
        }

        let result = unsafe { libc::munmap(address as *mut c_void, page_aligned(size)) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
