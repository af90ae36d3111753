//! Core types and utilities for the canister host-call emulator.

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::{Error, HostSurfaceError, MemoryAccessError, Result, TrapEvent};
pub use types::*;
