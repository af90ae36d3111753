//! Invocation driver: discovers entry points and runs them in a fixed order.

use canister_core::{EmulatorConfig, Result};
use canister_runtime::{CallFailure, CanisterInstance, InvocationContext, Runtime};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::report::{InvocationOutcome, InvocationReport, RunReport};

pub const RUNTIME_INFO_METHOD: &str = "__motoko_runtime_information";
pub const INIT_EXPORT: &str = "canister_init";
const QUERY_PREFIX: &str = "canister_query ";
const COMPOSITE_QUERY_PREFIX: &str = "canister_composite_query ";

/// Role of a discovered export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    RuntimeInformation,
    Init,
    Query,
}

/// An export the driver will call, with the method name the guest sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub export: String,
    pub method: String,
    pub kind: EntryKind,
}

/// Driver lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Loading,
    Instantiated,
    Invoking(String),
    Reported,
    Done,
    Failed,
}

fn query_method(export: &str) -> Option<&str> {
    export
        .strip_prefix(QUERY_PREFIX)
        .or_else(|| export.strip_prefix(COMPOSITE_QUERY_PREFIX))
}

/// Order the recognised exports: runtime information, initializer, then
/// every other query sorted by export name.
pub fn discover(exports: &[String]) -> Vec<EntryPoint> {
    let runtime_info_query = format!("{}{}", QUERY_PREFIX, RUNTIME_INFO_METHOD);
    let mut plan = Vec::new();

    let runtime_info = exports
        .iter()
        .find(|export| **export == runtime_info_query)
        .or_else(|| exports.iter().find(|export| export.as_str() == RUNTIME_INFO_METHOD));
    if let Some(export) = runtime_info {
        plan.push(EntryPoint {
            export: export.clone(),
            method: RUNTIME_INFO_METHOD.to_string(),
            kind: EntryKind::RuntimeInformation,
        });
    }

    if exports.iter().any(|export| export == INIT_EXPORT) {
        plan.push(EntryPoint {
            export: INIT_EXPORT.to_string(),
            method: String::new(),
            kind: EntryKind::Init,
        });
    }

    let mut queries: Vec<EntryPoint> = exports
        .iter()
        .filter(|export| **export != runtime_info_query)
        .filter_map(|export| {
            query_method(export).map(|method| EntryPoint {
                export: export.clone(),
                method: method.to_string(),
                kind: EntryKind::Query,
            })
        })
        .collect();
    queries.sort_by(|a, b| a.export.cmp(&b.export));
    plan.extend(queries);

    plan
}

/// Runs every discovered entry point of one artifact, one at a time.
pub struct Driver {
    runtime: Runtime,
    state: DriverState,
}

impl Driver {
    pub fn new(config: EmulatorConfig) -> Result<Self> {
        Ok(Self {
            runtime: Runtime::new(config)?,
            state: DriverState::Idle,
        })
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    fn transition(&mut self, next: DriverState) {
        debug!("Driver state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Load `path`, then invoke each recognised export exactly once.
    ///
    /// Artifact errors abort the run; per-invocation failures are recorded
    /// in the report and never stop the remaining invocations.
    pub fn run(&mut self, path: &Path) -> Result<RunReport> {
        self.transition(DriverState::Loading);
        info!("Loading canister artifact {}", path.display());

        let (module, mut instance, context) = match self.load(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.transition(DriverState::Failed);
                return Err(e);
            }
        };
        self.transition(DriverState::Instantiated);
        info!("Exports: {}", instance.exports().join(", "));

        let plan = discover(instance.exports());
        let mut invocations = Vec::with_capacity(plan.len());
        for entry in &plan {
            self.transition(DriverState::Invoking(entry.export.clone()));
            invocations.push(invoke(&mut instance, &context, entry));
            self.transition(DriverState::Reported);
        }
        self.transition(DriverState::Done);

        Ok(RunReport {
            artifact: path.display().to_string(),
            imports: module.imports(),
            exports: instance.exports().to_vec(),
            memory: instance.memory_origin(),
            invocations,
        })
    }

    fn load(
        &self,
        path: &Path,
    ) -> Result<(
        canister_runtime::CanisterModule,
        CanisterInstance,
        std::sync::Arc<InvocationContext>,
    )> {
        let module = self.runtime.load(path)?;
        let context = self.runtime.new_context();
        let instance = self.runtime.instantiate(&module, context.clone())?;
        Ok((module, instance, context))
    }
}

fn invoke(
    instance: &mut CanisterInstance,
    context: &InvocationContext,
    entry: &EntryPoint,
) -> InvocationReport {
    context.reset(&entry.method);
    info!("Calling {}", entry.export);

    let outcome = match instance.invoke(&entry.export) {
        Ok(()) => InvocationOutcome::Replied,
        Err(CallFailure::Trapped(trap)) => {
            warn!("{} trapped: {}", entry.export, trap.message);
            InvocationOutcome::Trapped {
                message: trap.message,
            }
        }
        Err(CallFailure::Faulted(message)) => {
            warn!("{} faulted: {}", entry.export, message);
            InvocationOutcome::Faulted { message }
        }
    };

    let reply = context.reply();
    InvocationReport {
        export: entry.export.clone(),
        method: entry.method.clone(),
        kind: entry.kind,
        outcome,
        reply: reply.bytes().to_vec(),
        reply_finalized: reply.is_finalized(),
        rejection: reply.rejection().map(str::to_owned),
        debug_output: context.debug_output(),
        calls: context.call_log(),
    }
}
