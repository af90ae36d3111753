//! WASM runtime for executing canister artifacts against an emulated `ic0`.
//!
//! This module provides the execution environment for canisters, including:
//! - Host call surface implementation (`ic0` system API)
//! - Bounds-checked linear memory access
//! - Per-invocation context and call tracing
//! - Emulated stable memory that persists across invocations

pub mod context;
pub mod host_functions;
pub mod instance;
pub mod memory;
pub mod stable;
pub mod tracer;

pub use context::{InvocationContext, ReplyBuffer};
pub use host_functions::{HostOp, HostSurface};
pub use instance::{CallFailure, CanisterInstance, CanisterModule};
pub use memory::{GuestMemory, MemoryOrigin};
pub use stable::StableMemory;
pub use tracer::{render_calls, CallTracer, HostCallRecord};

use canister_core::{EmulatorConfig, Error, Result};
use std::path::Path;
use std::sync::Arc;
use wasmtime::*;

/// The WASM runtime manager
pub struct Runtime {
    engine: Engine,
    config: EmulatorConfig,
}

impl Runtime {
    pub fn new(config: EmulatorConfig) -> Result<Self> {
        config.validate()?;

        let mut wasm_config = Config::new();
        wasm_config.max_wasm_stack(config.max_wasm_stack);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| Error::Artifact(format!("Failed to create engine: {}", e)))?;

        Ok(Self { engine, config })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Read and compile the artifact at `path`.
    pub fn load(&self, path: &Path) -> Result<CanisterModule> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Artifact(format!("Cannot read {}: {}", path.display(), e)))?;
        tracing::debug!("Read {} bytes from {}", bytes.len(), path.display());
        self.compile(&bytes)
    }

    /// Compile a binary (or text format) module.
    pub fn compile(&self, bytes: &[u8]) -> Result<CanisterModule> {
        CanisterModule::new(&self.engine, bytes)
    }

    pub fn new_context(&self) -> Arc<InvocationContext> {
        Arc::new(InvocationContext::from_config(&self.config))
    }

    /// Link `module` against the host call surface and instantiate it.
    pub fn instantiate(
        &self,
        module: &CanisterModule,
        context: Arc<InvocationContext>,
    ) -> Result<CanisterInstance> {
        let host = HostSurface::new(context, &self.config);
        CanisterInstance::new(&self.engine, module, host, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_runtime() {
        let runtime = Runtime::new(EmulatorConfig::default());
        assert!(runtime.is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EmulatorConfig {
            tracer_capacity: 0,
            ..Default::default()
        };
        assert!(Runtime::new(config).is_err());
    }

    #[test]
    fn test_missing_file_is_artifact_error() {
        let runtime = Runtime::new(EmulatorConfig::default()).unwrap();
        let err = runtime
            .load(Path::new("/nonexistent/canister.wasm"))
            .err()
            .unwrap();
        assert!(err.is_artifact_error());
    }
}
