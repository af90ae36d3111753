//! Bounds-checked access to guest linear memory.
//!
//! Nothing here fails hard: reads come back short, writes are clipped, and
//! the clipping is reported alongside the value so the caller can record it.

use canister_core::{GuestRange, MemoryAccessError};
use wasmtime::{AsContext, AsContextMut, Memory};

/// Where the authoritative linear memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum MemoryOrigin {
    /// Exported by the instance itself as `memory`
    Exported,
    /// Host placeholder satisfying an `env.memory` import
    Placeholder,
}

/// Result of a memory access together with any clipping that happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access<T> {
    pub value: T,
    pub fault: Option<MemoryAccessError>,
}

impl<T> Access<T> {
    fn clean(value: T) -> Self {
        Self { value, fault: None }
    }
}

/// Handle to the instance's linear memory.
#[derive(Debug, Clone, Copy)]
pub struct GuestMemory {
    memory: Memory,
    origin: MemoryOrigin,
}

impl GuestMemory {
    pub fn new(memory: Memory, origin: MemoryOrigin) -> Self {
        Self { memory, origin }
    }

    pub fn origin(&self) -> MemoryOrigin {
        self.origin
    }

    pub fn size(&self, store: impl AsContext) -> u64 {
        self.memory.data_size(&store) as u64
    }

    pub fn read_bytes(&self, store: impl AsContext, range: GuestRange) -> Access<Vec<u8>> {
        read_clipped(self.memory.data(&store), range)
    }

    pub fn write_bytes(&self, mut store: impl AsContextMut, offset: u64, bytes: &[u8]) -> Access<usize> {
        write_clipped(self.memory.data_mut(&mut store), offset, bytes)
    }

    pub fn decode_text(&self, store: impl AsContext, range: GuestRange) -> Access<String> {
        let read = self.read_bytes(store, range);
        Access {
            value: decode_text(&read.value),
            fault: read.fault,
        }
    }
}

/// Copy `range` out of `data`, keeping only the bytes that exist.
pub fn read_clipped(data: &[u8], range: GuestRange) -> Access<Vec<u8>> {
    let size = data.len() as u64;
    let start = range.offset.min(size);
    let end = range.end().min(size);

    let value = data[start as usize..end as usize].to_vec();
    if end - start == range.len {
        return Access::clean(value);
    }

    Access {
        value,
        fault: Some(MemoryAccessError {
            offset: range.offset,
            requested: range.len,
            available: end - start,
            memory_size: size,
        }),
    }
}

/// Write as much of `bytes` as fits at `offset`; returns the count written.
pub fn write_clipped(data: &mut [u8], offset: u64, bytes: &[u8]) -> Access<usize> {
    let size = data.len() as u64;
    let requested = bytes.len() as u64;
    let start = offset.min(size);
    let end = offset.saturating_add(requested).min(size);
    let written = (end - start) as usize;

    data[start as usize..end as usize].copy_from_slice(&bytes[..written]);
    if written as u64 == requested {
        return Access::clean(written);
    }

    Access {
        value: written,
        fault: Some(MemoryAccessError {
            offset,
            requested,
            available: written as u64,
            memory_size: size,
        }),
    }
}

/// Strict UTF-8 decode; invalid input yields an empty string.
pub fn decode_text(bytes: &[u8]) -> String {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_in_bounds() {
        let data = [1u8, 2, 3, 4];
        let read = read_clipped(&data, GuestRange::new(1, 2));
        assert_eq!(read.value, vec![2, 3]);
        assert!(read.fault.is_none());
    }

    #[test]
    fn test_read_past_end_is_clipped_and_reported() {
        let data = [1u8, 2, 3, 4];
        let read = read_clipped(&data, GuestRange::new(2, 10));
        assert_eq!(read.value, vec![3, 4]);
        let fault = read.fault.unwrap();
        assert_eq!(fault.requested, 10);
        assert_eq!(fault.available, 2);
        assert_eq!(fault.memory_size, 4);
    }

    #[test]
    fn test_read_entirely_outside() {
        let data = [0u8; 8];
        let read = read_clipped(&data, GuestRange::from_i32(-16, 4));
        assert!(read.value.is_empty());
        assert!(read.fault.is_some());
    }

    #[test]
    fn test_empty_read_is_clean_anywhere() {
        let data = [0u8; 8];
        let read = read_clipped(&data, GuestRange::new(100, 0));
        assert!(read.value.is_empty());
        assert!(read.fault.is_none());
    }

    #[test]
    fn test_write_truncates_excess() {
        let mut data = [0u8; 4];
        let write = write_clipped(&mut data, 2, &[7, 8, 9]);
        assert_eq!(write.value, 2);
        assert_eq!(data, [0, 0, 7, 8]);
        assert!(write.fault.is_some());
    }

    #[test]
    fn test_write_outside_touches_nothing() {
        let mut data = [0u8; 4];
        let write = write_clipped(&mut data, u64::MAX, &[1, 2]);
        assert_eq!(write.value, 0);
        assert_eq!(data, [0u8; 4]);
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"boom"), "boom");
        assert_eq!(decode_text(&[0xff, 0xfe]), "");
    }

    proptest! {
        #[test]
        fn prop_read_never_exceeds_available(
            size in 0usize..256,
            offset in any::<u64>(),
            len in any::<u64>(),
        ) {
            let data = vec![0xaau8; size];
            let read = read_clipped(&data, GuestRange::new(offset, len));
            let available = (size as u64).saturating_sub(offset).min(len);
            prop_assert_eq!(read.value.len() as u64, available);
            prop_assert_eq!(read.fault.is_some(), available != len);
        }

        #[test]
        fn prop_write_stays_in_bounds(
            size in 0usize..128,
            offset in 0u64..256,
            bytes in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut data = vec![0u8; size];
            let write = write_clipped(&mut data, offset, &bytes);
            prop_assert_eq!(data.len(), size);
            prop_assert!(write.value <= bytes.len());
            prop_assert!(offset + write.value as u64 <= size as u64 || write.value == 0);
        }
    }
}
