#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

// Kept apart from the other local tests: it counts threads and RWX mappings
// of the whole test process.

use std::time::Duration;

use e4c_lib::routines::routine;
use e4c_lib::system_tools::MemoryMap;
use e4c_lib::{InjectError, Injector, LocalProcess};

fn thread_count() -> usize {
    let status = std::fs::read_to_string("/proc/self/status").unwrap();
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|count| count.trim().parse().ok())
        .unwrap()
}

fn rwx_mappings() -> usize {
    MemoryMap::current()
        .unwrap()
        .iter()
        .filter(|entry| entry.get_perms() == "rwxp")
        .count()
}

#[test]
fn test_spinning_thread_is_stopped_and_memory_freed() {
    let process = LocalProcess::current();
    let spin = routine("spin").unwrap();
    let threads_before = thread_count();
    let mappings_before = rwx_mappings();

    let injector = Injector::new(&process)
        .with_timeout(Some(Duration::from_millis(100)))
        .with_terminate_grace(Duration::from_secs(5));

    let err = injector.inject_and_run(&spin.blob).unwrap_err();
    assert!(
        matches!(err, InjectError::TimedOut(t) if t == Duration::from_millis(100)),
        "unexpected error: {:?}",
        err
    );
    assert_eq!(thread_count(), threads_before);
    assert_eq!(rwx_mappings(), mappings_before);

    // The process stays usable for further injections
    let add = routine("add_two_three").unwrap();
    assert_eq!(injector.inject_and_run(&add.blob).unwrap(), 5);
    assert_eq!(rwx_mappings(), mappings_before);
}
