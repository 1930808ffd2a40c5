// Built-in injectable routines.
//
// Each routine is emitted in assembly so that its end marker is guaranteed to
// follow it directly; nothing the compiler does can reorder or inline them.
// All of them are position independent and shaped like thread start routines.

use lazy_static::lazy_static;
use std::collections::HashMap;

use crate::extractor::CodeBlob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routine {
    pub name: &'static str,
    pub blob: CodeBlob,
    /// Exit code the routine produces when run without arguments
    pub expected_exit_code: Option<u32>,
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod x86_64 {
    use super::Routine;
    use crate::extractor::CodeBlob;

    core::arch::global_asm!(
        ".pushsection .text.e4c_routines,\"ax\",@progbits",
        ".p2align 4",
        ".globl e4c_example_proc",
        "e4c_example_proc:",
        "    lea eax, [rdi + rsi]",
        "    ret",
        ".globl e4c_example_proc_end",
        "e4c_example_proc_end:",
        ".p2align 4",
        ".globl e4c_inject_proc",
        "e4c_inject_proc:",
        "    mov eax, 666",
        "    ret",
        ".globl e4c_inject_proc_end",
        "e4c_inject_proc_end:",
        ".p2align 4",
        ".globl e4c_add_two_three",
        "e4c_add_two_three:",
        "    mov eax, 2",
        "    add eax, 3",
        "    ret",
        ".globl e4c_add_two_three_end",
        "e4c_add_two_three_end:",
        ".p2align 4",
        ".globl e4c_ret_only",
        "e4c_ret_only:",
        "    ret",
        ".globl e4c_ret_only_end",
        "e4c_ret_only_end:",
        ".p2align 4",
        ".globl e4c_spin",
        "e4c_spin:",
        "2:",
        "    jmp 2b",
        ".globl e4c_spin_end",
        "e4c_spin_end:",
        ".popsection",
    );

    // End markers are declared as functions only to take their address
    unsafe extern "C" {
        pub safe fn e4c_example_proc(a: i32, b: i32) -> i32;
        fn e4c_example_proc_end();
        fn e4c_inject_proc();
        fn e4c_inject_proc_end();
        fn e4c_add_two_three();
        fn e4c_add_two_three_end();
        fn e4c_ret_only();
        fn e4c_ret_only_end();
        fn e4c_spin();
        fn e4c_spin_end();
    }

    fn routine(
        name: &'static str,
        entry: unsafe extern "C" fn(),
        end_marker: unsafe extern "C" fn(),
        expected_exit_code: Option<u32>,
    ) -> Routine {
        // Entry and sentinel come from the same global_asm block above
        let blob = unsafe { CodeBlob::extract(entry as *const u8, end_marker as *const u8) };
        Routine {
            name,
            blob,
            expected_exit_code,
        }
    }

    pub fn builtin_routines() -> Vec<Routine> {
        let example_proc = unsafe {
            CodeBlob::extract(
                e4c_example_proc as *const u8,
                e4c_example_proc_end as *const u8,
            )
        };
        vec![
            Routine {
                name: "example_proc",
                blob: example_proc,
                expected_exit_code: None,
            },
            routine("inject_proc", e4c_inject_proc, e4c_inject_proc_end, Some(666)),
            routine(
                "add_two_three",
                e4c_add_two_three,
                e4c_add_two_three_end,
                Some(5),
            ),
            routine("ret_only", e4c_ret_only, e4c_ret_only_end, None),
            routine("spin", e4c_spin, e4c_spin_end, None),
        ]
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
mod fallback {
    pub fn builtin_routines() -> Vec<super::Routine> {
        Vec::new()
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
use x86_64::builtin_routines;

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
use fallback::builtin_routines;

lazy_static! {
    static ref ROUTINES: HashMap<&'static str, Routine> = builtin_routines()
        .into_iter()
        .map(|routine| (routine.name, routine))
        .collect();
}

/// Looks up a built-in routine by name
pub fn routine(name: &str) -> Option<Routine> {
    ROUTINES.get(name).copied()
}

/// Names of all built-in routines, sorted
pub fn routine_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = ROUTINES.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Calls `example_proc` in place, as an ordinary function.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub fn example_proc(a: i32, b: i32) -> i32 {
    x86_64::e4c_example_proc(a, b)
}
