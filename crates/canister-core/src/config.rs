//! Configuration for the emulator.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{mock_principal, EMPTY_CANDID_ARGS};
use crate::{Error, InvocationMessage, Result};

/// Emulator configuration.
///
/// Every field has a default, so a config file only needs the values it
/// wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Maximum number of host calls kept in the call log
    pub tracer_capacity: usize,
    /// Argument bytes handed to every invocation
    pub argument_bytes: Vec<u8>,
    /// Identity of the mock caller
    pub caller_id: Vec<u8>,
    /// Identity reported by `canister_self_*`
    pub canister_id: Vec<u8>,
    /// Initial size of the host placeholder memory (64 KiB pages)
    pub placeholder_memory_pages: u32,
    /// Upper bound for the host placeholder memory (64 KiB pages)
    pub placeholder_memory_max_pages: u32,
    /// Upper bound for emulated stable memory (64 KiB pages)
    pub stable_memory_max_pages: u32,
    /// Maximum wasm stack size in bytes
    pub max_wasm_stack: usize,
    /// Fixed base for the stand-in clock; wall clock at start when unset
    pub time_base_nanos: Option<u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            tracer_capacity: 300,
            argument_bytes: EMPTY_CANDID_ARGS.to_vec(),
            caller_id: mock_principal(),
            canister_id: mock_principal(),
            placeholder_memory_pages: 100,
            placeholder_memory_max_pages: 1000,
            stable_memory_max_pages: 16,
            max_wasm_stack: 1024 * 1024,
            time_base_nanos: None,
        }
    }
}

impl EmulatorConfig {
    /// Load a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracer_capacity == 0 {
            return Err(Error::Config("tracer_capacity must be at least 1".to_string()));
        }
        if self.placeholder_memory_pages > self.placeholder_memory_max_pages {
            return Err(Error::Config(format!(
                "placeholder_memory_pages ({}) exceeds placeholder_memory_max_pages ({})",
                self.placeholder_memory_pages, self.placeholder_memory_max_pages
            )));
        }
        Ok(())
    }

    /// The message template every invocation starts from.
    pub fn message_template(&self) -> InvocationMessage {
        InvocationMessage::new(
            self.argument_bytes.clone(),
            self.caller_id.clone(),
            self.canister_id.clone(),
        )
    }

    /// Base of the stand-in clock in nanoseconds since the Unix epoch.
    pub fn clock_base_nanos(&self) -> u64 {
        self.time_base_nanos.unwrap_or_else(|| {
            chrono::Utc::now()
                .timestamp_nanos_opt()
                .map(|nanos| nanos.max(0) as u64)
                .unwrap_or(0)
        })
    }
}
