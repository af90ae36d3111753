//! Core type definitions shared by the runtime and the runner.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Candid encoding of an empty argument tuple: magic `DIDL`, no types, no values.
pub const EMPTY_CANDID_ARGS: [u8; 6] = [0x44, 0x49, 0x44, 0x4c, 0x00, 0x00];

/// Length of the mock principals handed to the guest.
pub const MOCK_PRINCIPAL_LEN: usize = 32;

/// Opaque identity bytes used for both the caller and the canister itself.
pub fn mock_principal() -> Vec<u8> {
    let mut principal = vec![0u8; MOCK_PRINCIPAL_LEN];
    principal[0] = 1;
    principal
}

/// A byte range in guest linear memory.
///
/// Every pointer/length pair crossing the host boundary is normalized into
/// this type exactly once. Guest integers are reinterpreted as unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuestRange {
    pub offset: u64,
    pub len: u64,
}

impl GuestRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Normalize a 32-bit `(ptr, len)` pair as passed by the guest.
    pub fn from_i32(ptr: i32, len: i32) -> Self {
        Self::new(u64::from(ptr as u32), u64::from(len as u32))
    }

    /// Normalize a 64-bit `(ptr, len)` pair as passed by the guest.
    pub fn from_i64(ptr: i64, len: i64) -> Self {
        Self::new(ptr as u64, len as u64)
    }

    /// Normalize a lone 32-bit destination pointer.
    pub fn offset_from_i32(ptr: i32) -> u64 {
        Self::from_i32(ptr, 0).offset
    }

    /// Normalize a lone 64-bit destination pointer.
    pub fn offset_from_i64(ptr: i64) -> u64 {
        Self::from_i64(ptr, 0).offset
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for GuestRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}; {}]", self.offset, self.len)
    }
}

/// The message being processed by the current invocation.
///
/// `caller_id` and `canister_id` are reused across a run; `method_name`
/// and `argument_bytes` are set fresh for every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationMessage {
    pub argument_bytes: Vec<u8>,
    pub caller_id: Vec<u8>,
    pub canister_id: Vec<u8>,
    pub method_name: String,
}

impl InvocationMessage {
    pub fn new(argument_bytes: Vec<u8>, caller_id: Vec<u8>, canister_id: Vec<u8>) -> Self {
        Self {
            argument_bytes,
            caller_id,
            canister_id,
            method_name: String::new(),
        }
    }
}

impl Default for InvocationMessage {
    fn default() -> Self {
        Self::new(EMPTY_CANDID_ARGS.to_vec(), mock_principal(), mock_principal())
    }
}

/// Render bytes as contiguous lowercase hex, e.g. `010203`.
pub fn to_hex(bytes: &[u8]) -> String {
    use fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Parse a hex string, ignoring whitespace and an optional `0x` prefix.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    if digits.len() % 2 != 0 {
        return Err(Error::Config(format!(
            "hex string has odd number of digits: {}",
            input
        )));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| Error::Config(format!("invalid hex byte: {}", &digits[i..i + 2])))
        })
        .collect()
}
