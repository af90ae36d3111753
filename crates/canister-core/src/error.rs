//! Error types for the emulator.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Artifact error: unsupported host operation {module}.{name}")]
    UnsupportedHostOperation { module: String, name: String },

    #[error("Memory access error: {0}")]
    MemoryAccess(#[from] MemoryAccessError),

    #[error("Host surface error: {0}")]
    HostSurface(#[from] HostSurfaceError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for every failure that aborts a run before any invocation.
    pub fn is_artifact_error(&self) -> bool {
        matches!(
            self,
            Error::Artifact(_) | Error::UnsupportedHostOperation { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Raised by the guest through the `trap` host operation.
///
/// Aborts the current invocation only. Travels through the runtime's
/// error channel and is recovered by downcasting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("canister trapped: {message}")]
pub struct TrapEvent {
    pub message: String,
}

impl TrapEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A host operation touched bytes outside the guest's linear memory.
///
/// Recovered locally: reads come back short and writes are clipped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("access of {requested} bytes at offset {offset} clipped to {available} (memory size {memory_size})")]
pub struct MemoryAccessError {
    pub offset: u64,
    pub requested: u64,
    pub available: u64,
    pub memory_size: u64,
}

/// Internal fault while servicing a host operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation}: {reason}")]
pub struct HostSurfaceError {
    pub operation: &'static str,
    pub reason: String,
}

impl HostSurfaceError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_display_carries_message() {
        let trap = TrapEvent::new("boom");
        assert_eq!(trap.to_string(), "canister trapped: boom");
    }

    #[test]
    fn test_unsupported_import_is_artifact_error() {
        let err = Error::UnsupportedHostOperation {
            module: "ic0".to_string(),
            name: "mint_cycles".to_string(),
        };
        assert!(err.is_artifact_error());
        assert!(err.to_string().contains("ic0.mint_cycles"));
    }

    #[test]
    fn test_host_surface_error_not_artifact() {
        let err: Error = HostSurfaceError::new("trap", "no linear memory").into();
        assert!(!err.is_artifact_error());
        assert_eq!(err.to_string(), "Host surface error: trap: no linear memory");
    }
}
