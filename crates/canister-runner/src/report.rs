//! Run reports and their text rendering.

use canister_core::to_hex;
use canister_runtime::{render_calls, HostCallRecord, MemoryOrigin};
use serde::{Serialize, Serializer};
use std::fmt::Write;

use crate::driver::EntryKind;

/// How one invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Replied,
    Trapped { message: String },
    Faulted { message: String },
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Replied)
    }
}

/// Everything observed during a single exported-entry-point call.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationReport {
    pub export: String,
    pub method: String,
    pub kind: EntryKind,
    pub outcome: InvocationOutcome,
    #[serde(serialize_with = "serialize_hex")]
    pub reply: Vec<u8>,
    pub reply_finalized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    pub debug_output: Vec<String>,
    pub calls: Vec<HostCallRecord>,
}

impl InvocationReport {
    pub fn reply_hex(&self) -> String {
        to_hex(&self.reply)
    }

    /// Lossy UTF-8 rendering of the reply.
    pub fn reply_text(&self) -> String {
        String::from_utf8_lossy(&self.reply).into_owned()
    }
}

/// Outcome of a complete run over one artifact.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub artifact: String,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub memory: Option<MemoryOrigin>,
    pub invocations: Vec<InvocationReport>,
}

impl RunReport {
    pub fn failures(&self) -> usize {
        self.invocations
            .iter()
            .filter(|invocation| !invocation.outcome.is_success())
            .count()
    }

    pub fn succeeded(&self) -> bool {
        self.failures() == 0
    }

    /// Process exit code: non-zero when any invocation failed.
    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Exports: {}", self.exports.join(", "));

        for invocation in &self.invocations {
            let _ = writeln!(out, "\nCalling {}", invocation.export);
            for line in &invocation.debug_output {
                let _ = writeln!(out, "  debug: {}", line);
            }
            if !invocation.reply.is_empty() {
                let _ = writeln!(out, "  reply hex: {}", invocation.reply_hex());
                let _ = writeln!(out, "  reply text: {}", invocation.reply_text().escape_debug());
            }
            if let Some(rejection) = &invocation.rejection {
                let _ = writeln!(out, "  rejected: {}", rejection);
            }

            match &invocation.outcome {
                InvocationOutcome::Replied => {
                    let _ = writeln!(out, "  ok ({} reply bytes)", invocation.reply.len());
                }
                InvocationOutcome::Trapped { message } => {
                    let _ = writeln!(out, "  trapped: {}", message);
                    let _ = write!(out, "  IC0 call log:\n{}", render_calls(&invocation.calls));
                }
                InvocationOutcome::Faulted { message } => {
                    let _ = writeln!(out, "  faulted: {}", message);
                    let _ = write!(out, "  IC0 call log:\n{}", render_calls(&invocation.calls));
                }
            }
        }

        let _ = writeln!(
            out,
            "\nDone: {} invocations, {} failed",
            self.invocations.len(),
            self.failures()
        );
        out
    }
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&to_hex(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(export: &str, outcome: InvocationOutcome, reply: &[u8]) -> InvocationReport {
        InvocationReport {
            export: export.to_string(),
            method: export.trim_start_matches("canister_query ").to_string(),
            kind: EntryKind::Query,
            outcome,
            reply: reply.to_vec(),
            reply_finalized: true,
            rejection: None,
            debug_output: Vec::new(),
            calls: Vec::new(),
        }
    }

    fn report(invocations: Vec<InvocationReport>) -> RunReport {
        RunReport {
            artifact: "test.wasm".to_string(),
            imports: Vec::new(),
            exports: invocations.iter().map(|i| i.export.clone()).collect(),
            memory: Some(MemoryOrigin::Exported),
            invocations,
        }
    }

    #[test]
    fn test_empty_run_succeeds() {
        let report = report(Vec::new());
        assert!(report.succeeded());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_any_failure_sets_exit_code() {
        let report = report(vec![
            invocation("canister_query a", InvocationOutcome::Replied, &[1, 2, 3]),
            invocation(
                "canister_query b",
                InvocationOutcome::Trapped {
                    message: "boom".to_string(),
                },
                &[],
            ),
        ]);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.exit_code(), 1);

        let text = report.render_text();
        assert!(text.contains("reply hex: 010203"));
        assert!(text.contains("trapped: boom"));
        assert!(text.contains("Done: 2 invocations, 1 failed"));
    }

    #[test]
    fn test_json_renders_reply_as_hex() {
        let report = report(vec![invocation(
            "canister_query a",
            InvocationOutcome::Replied,
            &[0xca, 0xfe],
        )]);
        let json = serde_json::to_value(&report).unwrap();
        let first = &json["invocations"][0];
        assert_eq!(first["reply"], "cafe");
        assert_eq!(first["outcome"]["status"], "replied");
        assert_eq!(first["kind"], "query");
        assert_eq!(json["memory"], "Exported");
    }
}
