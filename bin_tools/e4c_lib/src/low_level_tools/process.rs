use std::io;
use std::time::Duration;

/// How a wait on a remote thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited,
    TimedOut,
}

/// Primitive operations a target process must offer to host injected code.
///
/// All methods take `&self` so that per-stage guards can keep a shared borrow
/// of the process while later stages keep using it.
pub trait TargetProcess {
    /// Handle to a thread of execution started by [`TargetProcess::spawn_thread`]
    type Thread;

    fn pid(&self) -> u32;

    /// Reserves `size` bytes of read-write-execute memory, returns its base
    fn allocate(&self, size: usize) -> io::Result<u64>;

    fn write(&self, address: u64, data: &[u8]) -> io::Result<()>;

    fn flush_instruction_cache(&self, address: u64, size: usize) -> io::Result<()>;

    /// Starts a thread at `entry` with no argument
    fn spawn_thread(&self, entry: u64) -> io::Result<Self::Thread>;

    /// Blocks until the thread finishes, or until `timeout` elapses if given
    fn wait_thread(
        &self,
        thread: &mut Self::Thread,
        timeout: Option<Duration>,
    ) -> io::Result<WaitOutcome>;

    /// Termination value of a thread that finished
    fn exit_code(&self, thread: &Self::Thread) -> io::Result<u32>;

    /// Stops a thread that is still running. Succeeds only once the thread is
    /// confirmed to no longer execute, waiting at most `grace` for that.
    fn terminate_thread(&self, thread: &mut Self::Thread, grace: Duration) -> io::Result<()>;

    /// Releases the thread handle. Called exactly once per spawned thread.
    fn close_thread(&self, thread: &mut Self::Thread) -> io::Result<()>;

    /// Releases memory obtained from [`TargetProcess::allocate`]
    fn free(&self, address: u64, size: usize) -> io::Result<()>;
}

/// Rounds `size` up to whole pages, never less than one page
pub fn page_aligned(size: usize) -> usize {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    if size == 0 {
        page_size
    } else {
        (size + page_size - 1) & !(page_size - 1)
    }
}
