pub mod maps;
pub mod vm_io;

pub use maps::{MemoryMap, MemoryMapEntry};
pub use vm_io::{read_process_memory, write_process_memory};
