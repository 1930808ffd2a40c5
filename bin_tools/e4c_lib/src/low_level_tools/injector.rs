use log::{debug, error, info, warn};
use std::io;
use std::time::Duration;

use super::process::{TargetProcess, WaitOutcome};
use crate::config::InjectorConfig;
use crate::constants::DEFAULT_TERMINATE_GRACE_MS;
use crate::error::{InjectError, InjectionResult};
use crate::extractor::CodeBlob;

/// Executable memory inside the target, freed when dropped
struct RemoteAllocation<'p, P: TargetProcess> {
    process: &'p P,
    base: u64,
    size: usize,
}

impl<'p, P: TargetProcess> RemoteAllocation<'p, P> {
    fn allocate(process: &'p P, size: usize) -> Result<Self, InjectError> {
        let base = process
            .allocate(size)
            .map_err(InjectError::AllocationFailed)?;
        info!(
            "Allocated {} bytes at 0x{:x} in process {}",
            size,
            base,
            process.pid()
        );
        Ok(RemoteAllocation {
            process,
            base,
            size,
        })
    }

    fn write(&self, code: &[u8]) -> Result<(), InjectError> {
        self.process
            .write(self.base, code)
            .map_err(InjectError::WriteFailed)?;
        info!("Wrote {} bytes of code to 0x{:x}", code.len(), self.base);
        Ok(())
    }

    fn synchronize(&self) -> Result<(), InjectError> {
        self.process
            .flush_instruction_cache(self.base, self.size)
            .map_err(InjectError::SyncFailed)?;
        info!("Flushed instruction cache for 0x{:x}", self.base);
        Ok(())
    }

    /// Gives up ownership without freeing; the memory stays mapped in the target
    fn leak(self) -> u64 {
        let base = self.base;
        std::mem::forget(self);
        base
    }
}

impl<P: TargetProcess> Drop for RemoteAllocation<'_, P> {
    fn drop(&mut self) {
        debug!("Freeing remote allocation at 0x{:x}", self.base);
        if let Err(e) = self.process.free(self.base, self.size) {
            error!(
                "Failed to free remote allocation at 0x{:x} in process {}: {}",
                self.base,
                self.process.pid(),
                e
            );
        }
    }
}

/// Thread of execution running injected code, handle closed when dropped
struct RemoteThread<'p, P: TargetProcess> {
    process: &'p P,
    handle: P::Thread,
}

impl<'p, P: TargetProcess> RemoteThread<'p, P> {
    fn spawn(process: &'p P, entry: u64) -> Result<Self, InjectError> {
        let handle = process
            .spawn_thread(entry)
            .map_err(InjectError::SpawnFailed)?;
        info!("Started remote thread at 0x{:x}", entry);
        Ok(RemoteThread { process, handle })
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
        self.process.wait_thread(&mut self.handle, timeout)
    }

    fn exit_code(&self) -> io::Result<u32> {
        self.process.exit_code(&self.handle)
    }

    fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        self.process.terminate_thread(&mut self.handle, grace)
    }
}

impl<P: TargetProcess> Drop for RemoteThread<'_, P> {
    fn drop(&mut self) {
        debug!("Closing remote thread handle");
        if let Err(e) = self.process.close_thread(&mut self.handle) {
            error!("Failed to close remote thread handle: {}", e);
        }
    }
}

/// Runs code blobs in a target process: allocate, write, flush the
/// instruction cache, then run on a new thread and collect its exit code.
///
/// Waits forever for the injected thread unless a timeout is set. On timeout
/// the thread is terminated before its memory is freed.
pub struct Injector<'p, P: TargetProcess> {
    process: &'p P,
    wait_timeout: Option<Duration>,
    terminate_grace: Duration,
}

impl<'p, P: TargetProcess> Injector<'p, P> {
    pub fn new(process: &'p P) -> Self {
        Injector {
            process,
            wait_timeout: None,
            terminate_grace: Duration::from_millis(DEFAULT_TERMINATE_GRACE_MS),
        }
    }

    pub fn from_config(process: &'p P, config: &InjectorConfig) -> Self {
        Injector {
            process,
            wait_timeout: config.wait_timeout(),
            terminate_grace: config.terminate_grace(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn inject_and_run(&self, blob: &CodeBlob) -> InjectionResult {
        self.run_code(blob.as_bytes())
    }

    /// Injects raw code bytes. An empty slice is rejected before the target
    /// is touched.
    pub fn run_code(&self, code: &[u8]) -> InjectionResult {
        let pid = self.process.pid();
        info!("Injecting {} bytes into process {}", code.len(), pid);

        let result = self.run_stages(code);
        match &result {
            Ok(exit_code) => info!("Remote thread in process {} returned {}", pid, exit_code),
            Err(e) => error!("Injection into process {} failed: {}", pid, e),
        }
        result
    }

    fn run_stages(&self, code: &[u8]) -> InjectionResult {
        if code.is_empty() {
            return Err(InjectError::EmptyBlob);
        }

        // Guards drop in reverse declaration order: thread handle, then memory
        let allocation = RemoteAllocation::allocate(self.process, code.len())?;
        allocation.write(code)?;
        allocation.synchronize()?;
        let mut thread = RemoteThread::spawn(self.process, allocation.base)?;

        match thread.wait(self.wait_timeout) {
            Ok(WaitOutcome::Exited) => {}
            Ok(WaitOutcome::TimedOut) => return Err(self.abandon(thread, allocation)),
            Err(e) => return Err(InjectError::ResultUnavailable(e)),
        }

        let exit_code = thread.exit_code().map_err(InjectError::ResultUnavailable)?;
        drop(thread);
        drop(allocation);
        Ok(exit_code)
    }

    /// Stops a thread that outlived the timeout. Its memory is freed only
    /// once the thread is confirmed stopped; otherwise it stays mapped.
    fn abandon(
        &self,
        mut thread: RemoteThread<'p, P>,
        allocation: RemoteAllocation<'p, P>,
    ) -> InjectError {
        let timeout = self.wait_timeout.unwrap_or_default();
        warn!(
            "Remote thread at 0x{:x} still running after {:?}, terminating",
            allocation.base, timeout
        );

        match thread.terminate(self.terminate_grace) {
            Ok(()) => {
                drop(thread);
                drop(allocation);
                InjectError::TimedOut(timeout)
            }
            Err(source) => {
                drop(thread);
                let address = allocation.leak();
                error!(
                    "Leaving 0x{:x} mapped: remote thread could not be stopped",
                    address
                );
                InjectError::TerminateFailed { address, source }
            }
        }
    }
}

/// Runs `blob` in `process` with an unbounded wait
pub fn inject_and_run<P: TargetProcess>(process: &P, blob: &CodeBlob) -> InjectionResult {
    Injector::new(process).inject_and_run(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Event, Fault, MOCK_BASE, MockProcess};

    // mov eax, 666; ret
    static INJECT_PROC: [u8; 6] = [0xB8, 0x9A, 0x02, 0x00, 0x00, 0xC3];

    fn blob() -> CodeBlob {
        CodeBlob::from_static(&INJECT_PROC)
    }

    fn is_free(event: &Event) -> bool {
        matches!(event, Event::Free { .. })
    }

    fn is_close(event: &Event) -> bool {
        matches!(event, Event::CloseThread)
    }

    #[test]
    fn test_successful_injection_sequence() {
        let process = MockProcess::new(666);

        let result = inject_and_run(&process, &blob());

        assert_eq!(result.unwrap(), 666);
        assert_eq!(
            process.events(),
            vec![
                Event::Allocate { size: 6 },
                Event::Write {
                    address: MOCK_BASE,
                    len: 6
                },
                Event::Flush {
                    address: MOCK_BASE,
                    size: 6
                },
                Event::Spawn { entry: MOCK_BASE },
                Event::Wait { timeout: None },
                Event::ExitCode,
                Event::CloseThread,
                Event::Free {
                    address: MOCK_BASE,
                    size: 6
                },
            ]
        );
        assert_eq!(process.written(), INJECT_PROC);
    }

    #[test]
    fn test_allocation_failure_stops_pipeline() {
        let process = MockProcess::failing(Fault::Allocate);

        let err = inject_and_run(&process, &blob()).unwrap_err();

        assert!(matches!(err, InjectError::AllocationFailed(_)));
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
        assert_eq!(process.events(), vec![Event::Allocate { size: 6 }]);
    }

    #[test]
    fn test_write_failure_frees_allocation() {
        let process = MockProcess::failing(Fault::Write);

        let err = inject_and_run(&process, &blob()).unwrap_err();

        assert!(matches!(err, InjectError::WriteFailed(_)));
        assert_eq!(err.raw_os_error(), Some(libc::EFAULT));
        assert_eq!(process.count(is_free), 1);
        assert_eq!(process.count(|e| matches!(e, Event::Flush { .. })), 0);
        assert_eq!(
            process.events().last(),
            Some(&Event::Free {
                address: MOCK_BASE,
                size: 6
            })
        );
    }

    #[test]
    fn test_sync_failure_frees_allocation() {
        let process = MockProcess::failing(Fault::Flush);

        let err = inject_and_run(&process, &blob()).unwrap_err();

        assert!(matches!(err, InjectError::SyncFailed(_)));
        assert_eq!(process.count(|e| matches!(e, Event::Spawn { .. })), 0);
        assert_eq!(process.count(is_free), 1);
    }

    #[test]
    fn test_spawn_failure_frees_allocation_only() {
        let process = MockProcess::failing(Fault::Spawn);

        let err = inject_and_run(&process, &blob()).unwrap_err();

        assert!(matches!(err, InjectError::SpawnFailed(_)));
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
        assert_eq!(process.count(is_close), 0);
        assert_eq!(process.count(is_free), 1);
    }

    #[test]
    fn test_wait_failure_releases_everything_once() {
        let process = MockProcess::failing(Fault::Wait);

        let err = inject_and_run(&process, &blob()).unwrap_err();

        assert!(matches!(err, InjectError::ResultUnavailable(_)));
        assert_eq!(process.count(|e| matches!(e, Event::ExitCode)), 0);
        assert_eq!(process.count(is_close), 1);
        assert_eq!(process.count(is_free), 1);
        assert!(process.position(is_close) < process.position(is_free));
    }

    #[test]
    fn test_result_unavailable_does_not_double_release() {
        let process = MockProcess::failing(Fault::ExitCode);

        let err = inject_and_run(&process, &blob()).unwrap_err();

        assert!(matches!(err, InjectError::ResultUnavailable(_)));
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert_eq!(process.count(is_close), 1);
        assert_eq!(process.count(is_free), 1);
        let events = process.events();
        assert_eq!(
            &events[events.len() - 3..],
            &[
                Event::ExitCode,
                Event::CloseThread,
                Event::Free {
                    address: MOCK_BASE,
                    size: 6
                }
            ]
        );
    }

    #[test]
    fn test_empty_code_never_reaches_process() {
        let process = MockProcess::new(0);

        let err = Injector::new(&process).run_code(&[]).unwrap_err();

        assert!(matches!(err, InjectError::EmptyBlob));
        assert!(process.events().is_empty());
    }

    #[test]
    fn test_single_byte_blob_completes() {
        static RET: [u8; 1] = [0xC3];
        let process = MockProcess::new(0);

        let result = inject_and_run(&process, &CodeBlob::from_static(&RET));

        assert!(result.is_ok());
        assert_eq!(process.events()[0], Event::Allocate { size: 1 });
        assert_eq!(process.count(is_free), 1);
    }

    #[test]
    fn test_timeout_terminates_before_free() {
        let process = MockProcess::failing(Fault::Hang);
        let timeout = Duration::from_millis(50);

        let err = Injector::new(&process)
            .with_timeout(Some(timeout))
            .inject_and_run(&blob())
            .unwrap_err();

        assert!(matches!(err, InjectError::TimedOut(t) if t == timeout));
        let terminate = process.position(|e| matches!(e, Event::Terminate)).unwrap();
        let close = process.position(is_close).unwrap();
        let free = process.position(is_free).unwrap();
        assert!(terminate < close && close < free);
        assert_eq!(process.count(is_free), 1);
        assert_eq!(process.count(|e| matches!(e, Event::ExitCode)), 0);
    }

    #[test]
    fn test_unstoppable_thread_keeps_its_memory() {
        let process = MockProcess::failing(Fault::HangUnstoppable);

        let err = Injector::new(&process)
            .with_timeout(Some(Duration::from_millis(10)))
            .inject_and_run(&blob())
            .unwrap_err();

        match err {
            InjectError::TerminateFailed { address, ref source } => {
                assert_eq!(address, MOCK_BASE);
                assert_eq!(source.raw_os_error(), Some(libc::ETIMEDOUT));
            }
            other => panic!("expected TerminateFailed, got {:?}", other),
        }
        assert_eq!(process.count(is_free), 0);
        assert_eq!(process.count(is_close), 1);
    }

    #[test]
    fn test_config_sets_timeout() {
        let process = MockProcess::new(7);
        let config = InjectorConfig {
            wait_timeout_ms: Some(1500),
            ..InjectorConfig::default()
        };

        let result = Injector::from_config(&process, &config).inject_and_run(&blob());

        assert_eq!(result.unwrap(), 7);
        assert_eq!(
            process.count(|e| *e
                == Event::Wait {
                    timeout: Some(Duration::from_millis(1500))
                }),
            1
        );
    }

    #[test]
    fn test_each_injection_gets_its_own_region() {
        let process = MockProcess::new(1);
        let injector = Injector::new(&process);

        injector.inject_and_run(&blob()).unwrap();
        injector.inject_and_run(&blob()).unwrap();

        let spawns: Vec<u64> = process
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Spawn { entry } => Some(entry),
                _ => None,
            })
            .collect();
        assert_eq!(spawns.len(), 2);
        assert_ne!(spawns[0], spawns[1]);
        assert_eq!(process.count(is_free), 2);
    }
}
