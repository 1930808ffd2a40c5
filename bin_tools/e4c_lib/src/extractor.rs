use dlopen::raw::Library;
use log::{debug, info};
use std::num::NonZeroUsize;

use crate::constants::END_MARKER_SUFFIX;
use crate::error::ExtractError;
use crate::system_tools::MemoryMap;

/// A function's compiled bytes, referenced in place.
///
/// The blob aliases code of a loaded image and is only valid while that image
/// stays mapped. It is never copied or freed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeBlob {
    base: usize,
    len: NonZeroUsize,
}

impl CodeBlob {
    /// Computes the blob spanning `entry..end_marker`.
    ///
    /// Panics if `end_marker` does not lie strictly after `entry`: that means
    /// the routine and its sentinel were not laid out as required.
    ///
    /// # Safety
    ///
    /// Both addresses must belong to the same mapped image, with `end_marker`
    /// placed by the toolchain directly after the routine. The image must stay
    /// mapped for as long as the blob or its bytes are used. The routine must
    /// be position independent for the blob to run anywhere else.
    pub unsafe fn extract(entry: *const u8, end_marker: *const u8) -> Self {
        let (entry, end_marker) = (entry as usize, end_marker as usize);
        let Some(len) = end_marker.checked_sub(entry).and_then(NonZeroUsize::new) else {
            panic!(
                "end marker 0x{:x} does not follow entry 0x{:x}",
                end_marker, entry
            );
        };
        CodeBlob { base: entry, len }
    }

    /// Wraps code held in a static buffer. Panics on an empty slice.
    pub fn from_static(code: &'static [u8]) -> Self {
        let Some(len) = NonZeroUsize::new(code.len()) else {
            panic!("code blob must not be empty");
        };
        CodeBlob {
            base: code.as_ptr() as usize,
            len,
        }
    }

    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    /// The code bytes in place. They borrow the image, not this value, so
    /// they stay usable after a temporary blob is gone.
    pub fn as_bytes(&self) -> &'static [u8] {
        // Constructors guarantee a readable, non-empty range that outlives the blob
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.len.get()) }
    }

    /// Checks that the whole blob sits inside one executable mapping of the
    /// current process, catching sentinels that landed in another section.
    pub fn verify_layout(&self) -> Result<(), ExtractError> {
        let not_executable = || ExtractError::LayoutNotExecutable {
            address: self.base(),
            len: self.len(),
        };

        let map = MemoryMap::current().map_err(|_| not_executable())?;
        match map.find_containing(self.base()) {
            Some(entry) if entry.is_executable() && entry.contains_range(self.base(), self.len()) => {
                debug!(
                    "Blob 0x{:x}+{} lies in {} ({})",
                    self.base(),
                    self.len(),
                    entry.get_pathname(),
                    entry.get_perms()
                );
                Ok(())
            }
            _ => Err(not_executable()),
        }
    }
}

/// Exported `<name>` / `<name>_end` symbol pair of an injectable routine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolPair {
    pub entry: String,
    pub end_marker: String,
}

impl SymbolPair {
    pub fn for_routine(name: &str) -> Self {
        SymbolPair {
            entry: name.to_string(),
            end_marker: format!("{}{}", name, END_MARKER_SUFFIX),
        }
    }

    /// Looks both symbols up in `library` and extracts the blob between them.
    ///
    /// # Safety
    ///
    /// Same contract as [`CodeBlob::extract`]: the image must export the pair
    /// with the end marker laid out right after the routine, and `library`
    /// must stay loaded while the blob is in use.
    pub unsafe fn resolve(&self, library: &Library) -> Result<CodeBlob, ExtractError> {
        let entry = unsafe { lookup(library, &self.entry)? };
        let end_marker = unsafe { lookup(library, &self.end_marker)? };
        let blob = unsafe { CodeBlob::extract(entry, end_marker) };
        info!(
            "Resolved {} at 0x{:x}, {} bytes",
            self.entry,
            blob.base(),
            blob.len()
        );
        Ok(blob)
    }

    /// [`SymbolPair::resolve`] against the running executable
    ///
    /// # Safety
    ///
    /// See [`SymbolPair::resolve`].
    pub unsafe fn resolve_in_self(&self) -> Result<CodeBlob, ExtractError> {
        let library = Library::open_self().map_err(|source| ExtractError::ImageOpen {
            image: "<self>".to_string(),
            source,
        })?;
        unsafe { self.resolve(&library) }
    }
}

unsafe fn lookup(library: &Library, name: &str) -> Result<*const u8, ExtractError> {
    unsafe { library.symbol::<*const u8>(name) }.map_err(|source| ExtractError::SymbolNotFound {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    static CODE: [u8; 16] = [0xC3; 16];

    #[test]
    fn test_extract_length_is_address_difference() {
        let entry = CODE.as_ptr();
        let end = unsafe { entry.add(CODE.len()) };

        let blob = unsafe { CodeBlob::extract(entry, end) };
        assert_eq!(blob.base(), entry as u64);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob.as_bytes(), &CODE);
    }

    #[test]
    fn test_extract_is_idempotent() {
        let entry = CODE.as_ptr();
        let end = unsafe { entry.add(5) };

        let first = unsafe { CodeBlob::extract(entry, end) };
        let second = unsafe { CodeBlob::extract(entry, end) };
        assert_eq!(first, second);
        assert_eq!(CODE, [0xC3; 16]);
    }

    #[test]
    fn test_single_byte_blob() {
        let entry = CODE.as_ptr();
        let blob = unsafe { CodeBlob::extract(entry, entry.add(1)) };
        assert_eq!(blob.len(), 1);
    }

    #[test]
    #[should_panic(expected = "does not follow entry")]
    fn test_empty_range_panics() {
        let entry = CODE.as_ptr();
        let _ = unsafe { CodeBlob::extract(entry, entry) };
    }

    #[test]
    #[should_panic(expected = "does not follow entry")]
    fn test_inverted_range_panics() {
        let entry = CODE.as_ptr();
        let _ = unsafe { CodeBlob::extract(entry.add(4), entry) };
    }

    fn first_bytes(count: usize) -> &'static [u8] {
        let entry = CODE.as_ptr();
        unsafe { CodeBlob::extract(entry, entry.add(count)) }.as_bytes()
    }

    #[test]
    fn test_bytes_outlive_temporary_blob() {
        let bytes = first_bytes(3);
        assert_eq!(bytes, &CODE[..3]);
        assert_eq!(
            CodeBlob::from_static(&CODE).as_bytes().as_ptr(),
            CODE.as_ptr()
        );
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn test_from_static_rejects_empty() {
        let _ = CodeBlob::from_static(&[]);
    }

    #[test]
    fn test_verify_layout() {
        let code_address = test_verify_layout as usize as *const u8;
        let blob = unsafe { CodeBlob::extract(code_address, code_address.add(1)) };
        assert!(blob.verify_layout().is_ok());

        // Static data is not executable
        let data_blob = CodeBlob::from_static(&CODE);
        assert!(matches!(
            data_blob.verify_layout(),
            Err(ExtractError::LayoutNotExecutable { len: 16, .. })
        ));
    }

    #[test]
    fn test_symbol_pair_names() {
        let pair = SymbolPair::for_routine("inject_proc");
        assert_eq!(pair.entry, "inject_proc");
        assert_eq!(pair.end_marker, "inject_proc_end");
    }

    #[test]
    fn test_missing_symbol_is_reported() {
        let pair = SymbolPair::for_routine("e4c_no_such_routine");
        match unsafe { pair.resolve_in_self() } {
            Err(ExtractError::SymbolNotFound { name, .. }) => {
                assert_eq!(name, "e4c_no_such_routine")
            }
            other => panic!("expected SymbolNotFound, got {:?}", other),
        }
    }
}
