#![cfg(any(test, feature = "test-utils"))]

//! Test utilities: a scripted target process that records every primitive
//! the injection pipeline calls on it and can fail any one of them.

use std::cell::{Cell, RefCell};
use std::io;
use std::time::Duration;

use crate::low_level_tools::process::{TargetProcess, WaitOutcome};

/// Base of the first allocation handed out by [`MockProcess`]
pub const MOCK_BASE: u64 = 0x7f00_0000_0000;
pub const MOCK_PID: u32 = 4242;
const MOCK_REGION_STRIDE: u64 = 0x10_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Allocate { size: usize },
    Write { address: u64, len: usize },
    Flush { address: u64, size: usize },
    Spawn { entry: u64 },
    Wait { timeout: Option<Duration> },
    ExitCode,
    Terminate,
    CloseThread,
    Free { address: u64, size: usize },
}

/// Which primitive misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Allocate,
    Write,
    Flush,
    Spawn,
    Wait,
    ExitCode,
    /// The thread never finishes but honors termination
    Hang,
    /// The thread never finishes and ignores termination
    HangUnstoppable,
}

impl Fault {
    pub fn errno(self) -> i32 {
        match self {
            Fault::Allocate => libc::ENOMEM,
            Fault::Write => libc::EFAULT,
            Fault::Flush => libc::EIO,
            Fault::Spawn => libc::EAGAIN,
            Fault::Wait => libc::ESRCH,
            Fault::ExitCode => libc::EINVAL,
            Fault::Hang => libc::EDEADLK,
            Fault::HangUnstoppable => libc::ETIMEDOUT,
        }
    }
}

#[derive(Debug)]
pub struct MockThread {
    pub entry: u64,
    finished: bool,
}

pub struct MockProcess {
    fault: Option<Fault>,
    exit_code: u32,
    events: RefCell<Vec<Event>>,
    memory: RefCell<Vec<u8>>,
    allocations: Cell<u64>,
}

impl MockProcess {
    /// A process whose injected threads all return `exit_code`
    pub fn new(exit_code: u32) -> Self {
        MockProcess {
            fault: None,
            exit_code,
            events: RefCell::new(Vec::new()),
            memory: RefCell::new(Vec::new()),
            allocations: Cell::new(0),
        }
    }

    pub fn failing(fault: Fault) -> Self {
        MockProcess {
            fault: Some(fault),
            ..MockProcess::new(0)
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| predicate(e)).count()
    }

    /// Position of the first event matching `predicate`
    pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.borrow().iter().position(predicate)
    }

    /// Bytes received by the last write
    pub fn written(&self) -> Vec<u8> {
        self.memory.borrow().clone()
    }

    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    fn check(&self, fault: Fault) -> io::Result<()> {
        if self.fault == Some(fault) {
            Err(io::Error::from_raw_os_error(fault.errno()))
        } else {
            Ok(())
        }
    }

    fn hangs(&self) -> bool {
        matches!(self.fault, Some(Fault::Hang | Fault::HangUnstoppable))
    }
}

impl TargetProcess for MockProcess {
    type Thread = MockThread;

    fn pid(&self) -> u32 {
        MOCK_PID
    }

    fn allocate(&self, size: usize) -> io::Result<u64> {
        self.record(Event::Allocate { size });
        self.check(Fault::Allocate)?;
        let index = self.allocations.get();
        self.allocations.set(index + 1);
        Ok(MOCK_BASE + index * MOCK_REGION_STRIDE)
    }

    fn write(&self, address: u64, data: &[u8]) -> io::Result<()> {
        self.record(Event::Write {
            address,
            len: data.len(),
        });
        self.check(Fault::Write)?;
        *self.memory.borrow_mut() = data.to_vec();
        Ok(())
    }

    fn flush_instruction_cache(&self, address: u64, size: usize) -> io::Result<()> {
        self.record(Event::Flush { address, size });
        self.check(Fault::Flush)
    }

    fn spawn_thread(&self, entry: u64) -> io::Result<MockThread> {
        self.record(Event::Spawn { entry });
        self.check(Fault::Spawn)?;
        Ok(MockThread {
            entry,
            finished: false,
        })
    }

    fn wait_thread(
        &self,
        thread: &mut MockThread,
        timeout: Option<Duration>,
    ) -> io::Result<WaitOutcome> {
        self.record(Event::Wait { timeout });
        self.check(Fault::Wait)?;
        if self.hangs() {
            return match timeout {
                Some(_) => Ok(WaitOutcome::TimedOut),
                // An unbounded wait would never return
                None => Err(io::Error::from_raw_os_error(libc::EDEADLK)),
            };
        }
        thread.finished = true;
        Ok(WaitOutcome::Exited)
    }

    fn exit_code(&self, thread: &MockThread) -> io::Result<u32> {
        self.record(Event::ExitCode);
        self.check(Fault::ExitCode)?;
        if !thread.finished {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(self.exit_code)
    }

    fn terminate_thread(&self, thread: &mut MockThread, _grace: Duration) -> io::Result<()> {
        self.record(Event::Terminate);
        self.check(Fault::HangUnstoppable)?;
        thread.finished = true;
        Ok(())
    }

    fn close_thread(&self, _thread: &mut MockThread) -> io::Result<()> {
        self.record(Event::CloseThread);
        Ok(())
    }

    fn free(&self, address: u64, size: usize) -> io::Result<()> {
        self.record(Event::Free { address, size });
        Ok(())
    }
}
