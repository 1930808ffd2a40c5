// memory mapping handling

/*
             The format of /proc/<pid>/maps is:

                 address           perms offset  dev   inode       pathname
                 00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
                 00651000-00652000 r--p 00051000 08:02 173521      /usr/bin/dbus-daemon
                 00e03000-00e24000 rw-p 00000000 00:00 0           [heap]
                 7fffb2d48000-7fffb2d49000 r-xp 00000000 00:00 0   [vdso]

             perms: r = read, w = write, x = execute, s = shared, p = private
*/

use log::{debug, warn};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

type Address = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMapEntry {
    address: Address,
    size: usize,
    perms: String,
    pathname: String,
}

impl MemoryMapEntry {
    /// Parses one maps line. Returns `None` for lines that don't describe a range.
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();

        // address perms offset dev inode [pathname]
        if parts.len() < 5 {
            return None;
        }

        let (start, end) = parts[0].split_once('-')?;
        let address = u64::from_str_radix(start, 16).ok()?;
        let end_address = u64::from_str_radix(end, 16).ok()?;
        if end_address <= address {
            return None;
        }

        // Pathname may contain spaces
        let pathname = if parts.len() > 5 {
            parts[5..].join(" ")
        } else {
            String::new()
        };

        Some(MemoryMapEntry {
            address,
            size: (end_address - address) as usize,
            perms: parts[1].to_string(),
            pathname,
        })
    }

    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    pub fn end_address(&self) -> Address {
        self.address + self.size as u64
    }

    /// True when `[address, address + len)` lies entirely in this mapping
    pub fn contains_range(&self, address: Address, len: usize) -> bool {
        match address.checked_add(len as u64) {
            Some(end) => address >= self.address && end <= self.end_address(),
            None => false,
        }
    }

    pub fn get_address(&self) -> Address {
        self.address
    }

    pub fn get_pathname(&self) -> &str {
        &self.pathname
    }

    pub fn get_size(&self) -> usize {
        self.size
    }

    pub fn get_perms(&self) -> &str {
        &self.perms
    }
}

/// Snapshot of a process's mappings keyed by start address
pub struct MemoryMap {
    entries: BTreeMap<Address, MemoryMapEntry>,
}

impl MemoryMap {
    pub fn new() -> Self {
        MemoryMap {
            entries: BTreeMap::new(),
        }
    }

    /// Reads the mappings of the current process
    pub fn current() -> io::Result<Self> {
        Self::read_from("/proc/self/maps")
    }

    /// Reads the mappings of another process
    pub fn for_process(pid: u32) -> io::Result<Self> {
        Self::read_from(format!("/proc/{}/maps", pid))
    }

    fn read_from(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            warn!("Failed to read {}: {}", path.display(), e);
            e
        })?;
        let map = Self::from_content(&content);
        debug!("Parsed {} mappings from {}", map.len(), path.display());
        Ok(map)
    }

    pub fn from_content(content: &str) -> Self {
        let mut map = MemoryMap::new();
        for line in content.lines() {
            map.add_from_line(line);
        }
        map
    }

    /// Returns the previous entry at the same address, if any
    fn add_from_line(&mut self, line: &str) -> Option<MemoryMapEntry> {
        let entry = MemoryMapEntry::parse(line)?;
        self.entries.insert(entry.address, entry)
    }

    /// Finds the mapping that contains `address`
    pub fn find_containing(&self, address: Address) -> Option<&MemoryMapEntry> {
        self.entries
            .range(..=address)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| address < entry.end_address())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryMapEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}
