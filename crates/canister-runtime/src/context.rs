//! Per-invocation state shared between the driver and the host surface.

use canister_core::{EmulatorConfig, InvocationMessage, MemoryAccessError};
use parking_lot::{Mutex, RwLock};

use crate::tracer::{CallTracer, HostCallRecord};

/// Reject code reported after the guest itself rejected the message.
pub const REJECT_CODE_SYS_FATAL: i32 = 1;

/// The reply the guest is building for the current invocation.
///
/// Grows monotonically within an invocation; only `clear` shrinks it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyBuffer {
    bytes: Vec<u8>,
    finalized: bool,
    rejection: Option<String>,
}

impl ReplyBuffer {
    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn reject(&mut self, message: String) {
        self.rejection = Some(message);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    /// Code served by `msg_reject_code`: 1 (SYS_FATAL) once rejected, else 0.
    pub fn reject_code(&self) -> i32 {
        if self.rejection.is_some() {
            REJECT_CODE_SYS_FATAL
        } else {
            0
        }
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.finalized = false;
        self.rejection = None;
    }
}

/// Byte sources the guest can query with a `*_size` / `*_copy` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Arguments,
    Caller,
    MethodName,
    CanisterId,
    Reply,
    RejectMessage,
}

/// Execution context shared between the host and the canister.
///
/// Built once per run and mutated in place by `reset` before every call.
pub struct InvocationContext {
    template: RwLock<InvocationMessage>,
    message: RwLock<InvocationMessage>,
    reply: RwLock<ReplyBuffer>,
    tracer: Mutex<CallTracer>,
    debug_output: Mutex<Vec<String>>,
}

impl InvocationContext {
    pub fn new(template: InvocationMessage, tracer_capacity: usize) -> Self {
        Self {
            message: RwLock::new(template.clone()),
            template: RwLock::new(template),
            reply: RwLock::new(ReplyBuffer::default()),
            tracer: Mutex::new(CallTracer::new(tracer_capacity)),
            debug_output: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &EmulatorConfig) -> Self {
        Self::new(config.message_template(), config.tracer_capacity)
    }

    /// Start a fresh invocation of `method_name`.
    pub fn reset(&self, method_name: &str) {
        let mut message = self.template.read().clone();
        message.method_name = method_name.to_string();
        *self.message.write() = message;

        self.reply.write().clear();
        self.tracer.lock().clear();
        self.debug_output.lock().clear();
    }

    /// Override the argument bytes used by subsequent invocations.
    pub fn set_argument_bytes(&self, bytes: Vec<u8>) {
        self.template.write().argument_bytes = bytes;
    }

    /// Override the caller identity used by subsequent invocations.
    pub fn set_caller_id(&self, caller_id: Vec<u8>) {
        self.template.write().caller_id = caller_id;
    }

    pub fn message(&self) -> InvocationMessage {
        self.message.read().clone()
    }

    pub fn source_bytes(&self, source: Source) -> Vec<u8> {
        match source {
            Source::Arguments => self.message.read().argument_bytes.clone(),
            Source::Caller => self.message.read().caller_id.clone(),
            Source::MethodName => self.message.read().method_name.as_bytes().to_vec(),
            Source::CanisterId => self.message.read().canister_id.clone(),
            Source::Reply => self.reply.read().bytes().to_vec(),
            Source::RejectMessage => self
                .reply
                .read()
                .rejection()
                .map(|msg| msg.as_bytes().to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn source_len(&self, source: Source) -> usize {
        match source {
            Source::Reply => self.reply.read().len(),
            other => self.source_bytes(other).len(),
        }
    }

    pub fn append_reply(&self, bytes: &[u8]) {
        self.reply.write().append(bytes);
    }

    pub fn finalize_reply(&self) {
        self.reply.write().finalize();
    }

    pub fn reject(&self, message: String) {
        self.reply.write().reject(message);
    }

    pub fn reject_code(&self) -> i32 {
        self.reply.read().reject_code()
    }

    pub fn reply(&self) -> ReplyBuffer {
        self.reply.read().clone()
    }

    pub fn record(&self, operation: &'static str, arguments: &[i64]) {
        self.tracer.lock().record(operation, arguments);
    }

    /// Note a clipped memory access against the latest call.
    pub fn note(&self, fault: Option<MemoryAccessError>) {
        if let Some(fault) = fault {
            tracing::debug!("Soft memory fault: {}", fault);
            self.tracer.lock().flag_last(fault.to_string());
        }
    }

    pub fn call_log(&self) -> Vec<HostCallRecord> {
        self.tracer.lock().dump()
    }

    pub fn push_debug(&self, line: String) {
        self.debug_output.lock().push(line);
    }

    pub fn debug_output(&self) -> Vec<String> {
        self.debug_output.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> InvocationContext {
        InvocationContext::from_config(&EmulatorConfig::default())
    }

    #[test]
    fn test_reply_concatenates_in_call_order() {
        let ctx = context();
        ctx.reset("greet");
        ctx.append_reply(b"ab");
        ctx.append_reply(b"cd");
        assert_eq!(ctx.reply().bytes(), b"abcd");
        assert_eq!(ctx.source_len(Source::Reply), 4);
    }

    #[test]
    fn test_reject_code_follows_rejection() {
        let ctx = context();
        ctx.reset("q");
        assert_eq!(ctx.reject_code(), 0);
        ctx.reject("denied".to_string());
        assert_eq!(ctx.reject_code(), REJECT_CODE_SYS_FATAL);
        ctx.reset("q");
        assert_eq!(ctx.reject_code(), 0);
    }

    #[test]
    fn test_reset_clears_everything_per_invocation() {
        let ctx = context();
        ctx.reset("first");
        ctx.append_reply(&[1, 2, 3]);
        ctx.finalize_reply();
        ctx.reject("nope".to_string());
        ctx.record("msg_reply", &[]);
        ctx.push_debug("hello".to_string());

        ctx.reset("second");
        let reply = ctx.reply();
        assert!(reply.is_empty());
        assert!(!reply.is_finalized());
        assert!(reply.rejection().is_none());
        assert!(ctx.call_log().is_empty());
        assert!(ctx.debug_output().is_empty());
        assert_eq!(ctx.message().method_name, "second");
        assert_eq!(ctx.source_bytes(Source::MethodName), b"second");
    }

    #[test]
    fn test_overrides_survive_reset() {
        let ctx = context();
        ctx.set_argument_bytes(vec![0xde, 0xad]);
        ctx.set_caller_id(vec![7]);
        ctx.reset("q");
        ctx.reset("q");
        assert_eq!(ctx.source_bytes(Source::Arguments), vec![0xde, 0xad]);
        assert_eq!(ctx.source_bytes(Source::Caller), vec![7]);
    }

    #[test]
    fn test_note_flags_latest_call() {
        let ctx = context();
        ctx.reset("q");
        ctx.record("msg_reply_data_append", &[65530, 100]);
        ctx.note(Some(MemoryAccessError {
            offset: 65530,
            requested: 100,
            available: 6,
            memory_size: 65536,
        }));
        ctx.note(None);

        let log = ctx.call_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].anomaly.as_deref().unwrap().contains("clipped to 6"));
    }
}
