//! Emulated stable memory.
//!
//! A growable byte buffer owned by the host surface. It lives as long as
//! the instance, so data written in one invocation is visible to the next.

use canister_core::GuestRange;

use crate::memory::{read_clipped, write_clipped, Access};

/// Size of one stable memory page.
pub const PAGE_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct StableMemory {
    bytes: Vec<u8>,
    max_pages: u64,
}

impl StableMemory {
    pub fn new(max_pages: u64) -> Self {
        Self {
            bytes: Vec::new(),
            max_pages,
        }
    }

    pub fn pages(&self) -> u64 {
        self.bytes.len() as u64 / PAGE_SIZE
    }

    /// Add `additional` zeroed pages. Returns the previous page count, or
    /// `None` when the limit would be exceeded.
    pub fn grow(&mut self, additional: u64) -> Option<u64> {
        let old = self.pages();
        let new = old.checked_add(additional)?;
        if new > self.max_pages {
            return None;
        }
        self.bytes.resize((new * PAGE_SIZE) as usize, 0);
        Some(old)
    }

    pub fn read(&self, range: GuestRange) -> Access<Vec<u8>> {
        read_clipped(&self.bytes, range)
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Access<usize> {
        write_clipped(&mut self.bytes, offset, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_returns_previous_size() {
        let mut stable = StableMemory::new(4);
        assert_eq!(stable.pages(), 0);
        assert_eq!(stable.grow(1), Some(0));
        assert_eq!(stable.grow(2), Some(1));
        assert_eq!(stable.pages(), 3);
    }

    #[test]
    fn test_grow_past_limit_fails_without_change() {
        let mut stable = StableMemory::new(2);
        assert_eq!(stable.grow(3), None);
        assert_eq!(stable.grow(u64::MAX), None);
        assert_eq!(stable.pages(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let mut stable = StableMemory::new(1);
        stable.grow(1);
        assert!(stable.write(10, b"abc").fault.is_none());
        assert_eq!(stable.read(GuestRange::new(10, 3)).value, b"abc");
    }

    #[test]
    fn test_access_beyond_size_is_clipped() {
        let mut stable = StableMemory::new(1);
        let write = stable.write(0, b"x");
        assert_eq!(write.value, 0);
        assert!(write.fault.is_some());

        stable.grow(1);
        let read = stable.read(GuestRange::new(PAGE_SIZE - 2, 8));
        assert_eq!(read.value, vec![0, 0]);
        assert!(read.fault.is_some());
    }
}
