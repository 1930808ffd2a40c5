#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use e4c_lib::routines::{example_proc, routine};
use e4c_lib::{CodeBlob, InjectError, Injector, LocalProcess, inject_and_run};

#[test]
fn test_add_two_three_round_trip() {
    let add = routine("add_two_three").unwrap();
    add.blob.verify_layout().unwrap();

    let result = inject_and_run(&LocalProcess::current(), &add.blob);
    assert_eq!(result.unwrap(), 5);
}

#[test]
fn test_inject_proc_returns_666() {
    let inject_proc = routine("inject_proc").unwrap();
    let exit_code = inject_and_run(&LocalProcess::current(), &inject_proc.blob).unwrap();
    assert_eq!(Some(exit_code), inject_proc.expected_exit_code);
}

#[test]
fn test_single_byte_routine_completes() {
    let ret_only = routine("ret_only").unwrap();
    assert_eq!(ret_only.blob.len(), 1);
    assert!(inject_and_run(&LocalProcess::current(), &ret_only.blob).is_ok());
}

#[test]
fn test_example_proc_in_place_and_sized() {
    // Called directly the routine adds its arguments, as Example 1 shows
    assert_eq!(example_proc(2, 3), 5);
    let blob = routine("example_proc").unwrap().blob;
    assert_eq!(blob.as_bytes().last(), Some(&0xC3));
}

#[test]
fn test_repeated_injections_are_independent() {
    let process = LocalProcess::current();
    let injector = Injector::new(&process);
    let blob = routine("add_two_three").unwrap().blob;

    for _ in 0..8 {
        assert_eq!(injector.inject_and_run(&blob).unwrap(), 5);
    }
}

#[test]
fn test_static_blob_injection() {
    // mov eax, 0x1234; ret
    static CODE: [u8; 6] = [0xB8, 0x34, 0x12, 0x00, 0x00, 0xC3];
    let blob = CodeBlob::from_static(&CODE);

    let result = Injector::new(&LocalProcess::current()).inject_and_run(&blob);
    assert_eq!(result.unwrap(), 0x1234);
}

#[test]
fn test_empty_code_rejected() {
    let err = Injector::new(&LocalProcess::current())
        .run_code(&[])
        .unwrap_err();
    assert!(matches!(err, InjectError::EmptyBlob));
}
