//! Canister module loading and instance management.

use crate::context::InvocationContext;
use crate::host_functions::{HostOp, HostSurface, IC0};
use crate::memory::{GuestMemory, MemoryOrigin};
use canister_core::{EmulatorConfig, Error, HostSurfaceError, Result, TrapEvent};
use std::sync::Arc;
use thiserror::Error as ThisError;
use wasmtime::*;

const PLACEHOLDER_MODULE: &str = "env";
const PLACEHOLDER_NAME: &str = "memory";
const MEMORY_EXPORT: &str = "memory";

/// Why a single invocation did not return normally.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    #[error("{0}")]
    Trapped(TrapEvent),

    #[error("fault: {0}")]
    Faulted(String),
}

impl CallFailure {
    fn from_error(err: anyhow::Error) -> Self {
        if let Some(trap) = err.downcast_ref::<TrapEvent>() {
            return CallFailure::Trapped(trap.clone());
        }
        if let Some(fault) = err.downcast_ref::<HostSurfaceError>() {
            return CallFailure::Faulted(fault.to_string());
        }
        if let Some(trap) = err.downcast_ref::<Trap>() {
            return CallFailure::Faulted(format!("wasm trap: {}", trap));
        }
        CallFailure::Faulted(format!("{:#}", err))
    }
}

/// A compiled canister artifact whose imports have been checked against
/// the host call surface.
pub struct CanisterModule {
    module: Module,
    memory_import: Option<MemoryType>,
}

impl CanisterModule {
    pub fn new(engine: &Engine, bytes: &[u8]) -> Result<Self> {
        let module = Module::new(engine, bytes)
            .map_err(|e| Error::Artifact(format!("Failed to compile module: {}", e)))?;

        let mut memory_import = None;
        for import in module.imports() {
            tracing::debug!("Import {}.{}", import.module(), import.name());
            match (import.module(), import.ty()) {
                (PLACEHOLDER_MODULE, ExternType::Memory(ty)) if import.name() == PLACEHOLDER_NAME => {
                    if ty.is_64() || ty.is_shared() {
                        return Err(Error::Artifact(
                            "64-bit or shared env.memory is not supported".to_string(),
                        ));
                    }
                    memory_import = Some(ty);
                }
                (IC0, ExternType::Func(_)) if HostOp::from_name(import.name()).is_some() => {}
                _ => {
                    return Err(Error::UnsupportedHostOperation {
                        module: import.module().to_string(),
                        name: import.name().to_string(),
                    });
                }
            }
        }

        Ok(Self {
            module,
            memory_import,
        })
    }

    /// `module.name` of every import, in declaration order.
    pub fn imports(&self) -> Vec<String> {
        self.module
            .imports()
            .map(|import| format!("{}.{}", import.module(), import.name()))
            .collect()
    }

    /// Names of all exported functions, sorted.
    pub fn exported_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .module
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .map(|export| export.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn imports_memory(&self) -> bool {
        self.memory_import.is_some()
    }
}

/// Size the host placeholder so it satisfies the guest's memory import.
fn placeholder_type(import: &MemoryType, config: &EmulatorConfig) -> MemoryType {
    let import_min = import.minimum().min(u64::from(u32::MAX)) as u32;
    let import_max = import.maximum().map(|max| max.min(u64::from(u32::MAX)) as u32);

    let mut minimum = config.placeholder_memory_pages.max(import_min);
    if let Some(max) = import_max {
        minimum = minimum.min(max);
    }
    let maximum = import_max
        .unwrap_or(config.placeholder_memory_max_pages)
        .min(config.placeholder_memory_max_pages)
        .max(minimum);

    MemoryType::new(minimum, Some(maximum))
}

/// A live canister instance. Memory and globals persist across calls.
pub struct CanisterInstance {
    store: Store<HostSurface>,
    instance: Instance,
    exports: Vec<String>,
}

impl CanisterInstance {
    pub fn new(
        engine: &Engine,
        module: &CanisterModule,
        host: HostSurface,
        config: &EmulatorConfig,
    ) -> Result<Self> {
        let mut linker = Linker::new(engine);
        HostSurface::add_to_linker(&mut linker)
            .map_err(|e| Error::Artifact(format!("Failed to add host functions: {}", e)))?;

        let mut store = Store::new(engine, host);

        if let Some(import) = &module.memory_import {
            let memory = Memory::new(&mut store, placeholder_type(import, config))
                .map_err(|e| Error::Artifact(format!("Failed to allocate placeholder memory: {}", e)))?;
            linker
                .define(&store, PLACEHOLDER_MODULE, PLACEHOLDER_NAME, memory)
                .map_err(|e| Error::Artifact(format!("Failed to define env.memory: {}", e)))?;
            store
                .data_mut()
                .bind_memory(GuestMemory::new(memory, MemoryOrigin::Placeholder));
        }

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| Error::Artifact(format!("Failed to instantiate: {:#}", e)))?;

        // The canister's own memory wins over the placeholder.
        if let Some(memory) = instance.get_memory(&mut store, MEMORY_EXPORT) {
            store
                .data_mut()
                .bind_memory(GuestMemory::new(memory, MemoryOrigin::Exported));
        }

        match store.data().memory() {
            Some(memory) => tracing::debug!(
                "Resolved {:?} linear memory of {} bytes",
                memory.origin(),
                memory.size(&store)
            ),
            None => tracing::warn!("Canister has no linear memory; memory-backed host calls will fault"),
        }

        Ok(Self {
            store,
            instance,
            exports: module.exported_functions(),
        })
    }

    pub fn context(&self) -> &Arc<InvocationContext> {
        self.store.data().context()
    }

    /// Sorted names of the exported functions.
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|export| export == name)
    }

    pub fn memory_origin(&self) -> Option<MemoryOrigin> {
        self.store.data().memory().map(|memory| memory.origin())
    }

    /// Run one exported entry point to completion or to a trap.
    pub fn invoke(&mut self, export: &str) -> std::result::Result<(), CallFailure> {
        let func = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, export)
            .map_err(|e| {
                CallFailure::Faulted(format!("export `{}` is not callable as () -> (): {}", export, e))
            })?;

        func.call(&mut self.store, ()).map_err(CallFailure::from_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;

    fn runtime() -> Runtime {
        Runtime::new(EmulatorConfig::default()).unwrap()
    }

    fn instantiate(wat: &str) -> Result<CanisterInstance> {
        let runtime = runtime();
        let module = runtime.compile(wat.as_bytes())?;
        runtime.instantiate(&module, runtime.new_context())
    }

    #[test]
    fn test_garbage_is_artifact_error() {
        let err = runtime().compile(b"\0asm garbage").err().unwrap();
        assert!(err.is_artifact_error());
    }

    #[test]
    fn test_unknown_import_fails_fast() {
        let err = runtime()
            .compile(br#"(module (import "ic0" "mint_cycles" (func (param i64))))"#)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::UnsupportedHostOperation { ref name, .. } if name == "mint_cycles"
        ));
    }

    #[test]
    fn test_foreign_import_module_fails_fast() {
        let err = runtime()
            .compile(br#"(module (import "env" "abort" (func)))"#)
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedHostOperation { .. }));
    }

    #[test]
    fn test_mismatched_signature_fails_instantiation() {
        let err = instantiate(r#"(module (import "ic0" "msg_reply" (func (param i32))))"#)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Artifact(_)));
    }

    #[test]
    fn test_exported_memory_is_authoritative() {
        let instance = instantiate(r#"(module (memory (export "memory") 1))"#).unwrap();
        assert_eq!(instance.memory_origin(), Some(MemoryOrigin::Exported));
    }

    #[test]
    fn test_placeholder_memory_serves_imports() {
        let mut instance = instantiate(
            r#"(module
                (import "env" "memory" (memory 1))
                (import "ic0" "msg_reply_data_append" (func $append (param i32 i32)))
                (data (i32.const 0) "\2a")
                (func (export "canister_query answer")
                    (call $append (i32.const 0) (i32.const 1))))"#,
        )
        .unwrap();
        assert_eq!(instance.memory_origin(), Some(MemoryOrigin::Placeholder));

        instance.context().reset("answer");
        instance.invoke("canister_query answer").unwrap();
        assert_eq!(instance.context().reply().bytes(), &[0x2a]);
    }

    #[test]
    fn test_placeholder_respects_import_maximum() {
        let config = EmulatorConfig::default();
        let ty = placeholder_type(&MemoryType::new(1, Some(2)), &config);
        assert_eq!(ty.minimum(), 2);
        assert_eq!(ty.maximum(), Some(2));

        let ty = placeholder_type(&MemoryType::new(300, None), &config);
        assert_eq!(ty.minimum(), 300);
        assert_eq!(ty.maximum(), Some(1000));
    }

    #[test]
    fn test_no_memory_faults_memory_ops() {
        let mut instance = instantiate(
            r#"(module
                (import "ic0" "debug_print" (func $print (param i32 i32)))
                (func (export "canister_query p") (call $print (i32.const 0) (i32.const 1))))"#,
        )
        .unwrap();
        assert_eq!(instance.memory_origin(), None);

        instance.context().reset("p");
        let failure = instance.invoke("canister_query p").unwrap_err();
        assert!(matches!(failure, CallFailure::Faulted(ref msg) if msg.contains("debug_print")));
    }

    #[test]
    fn test_state_persists_across_invocations() {
        let mut instance = instantiate(
            r#"(module
                (import "ic0" "msg_reply_data_append" (func $append (param i32 i32)))
                (memory (export "memory") 1)
                (global $calls (mut i32) (i32.const 0))
                (func (export "canister_init")
                    (i32.store8 (i32.const 100) (i32.const 7)))
                (func (export "canister_query peek")
                    (global.set $calls (i32.add (global.get $calls) (i32.const 1)))
                    (i32.store8 (i32.const 101) (global.get $calls))
                    (call $append (i32.const 100) (i32.const 2))))"#,
        )
        .unwrap();

        instance.context().reset("");
        instance.invoke("canister_init").unwrap();
        instance.context().reset("peek");
        instance.invoke("canister_query peek").unwrap();
        instance.context().reset("peek");
        instance.invoke("canister_query peek").unwrap();
        assert_eq!(instance.context().reply().bytes(), &[7, 2]);
    }

    #[test]
    fn test_wasm_trap_and_bad_signature_are_faults() {
        let mut instance = instantiate(
            r#"(module
                (func (export "canister_query crash") unreachable)
                (func (export "canister_query typed") (param i32)))"#,
        )
        .unwrap();

        let crash = instance.invoke("canister_query crash").unwrap_err();
        assert!(matches!(crash, CallFailure::Faulted(ref msg) if msg.starts_with("wasm trap")));

        let typed = instance.invoke("canister_query typed").unwrap_err();
        assert!(matches!(typed, CallFailure::Faulted(ref msg) if msg.contains("not callable")));
    }

    #[test]
    fn test_exports_are_sorted_functions() {
        let instance = instantiate(
            r#"(module
                (memory (export "memory") 1)
                (func (export "canister_query b"))
                (func (export "canister_query a")))"#,
        )
        .unwrap();
        assert_eq!(instance.exports(), &["canister_query a", "canister_query b"]);
        assert!(instance.has_export("canister_query a"));
        assert!(!instance.has_export("memory"));
    }
}
