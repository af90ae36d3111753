//! Bounded log of host calls made during one invocation.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write;

/// One host operation as the guest invoked it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostCallRecord {
    pub operation: &'static str,
    pub arguments: Vec<i64>,
    /// Set when the operation had to clip a memory access or otherwise
    /// degrade softly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<String>,
}

/// Capped call log; the oldest entry is evicted once capacity is exceeded.
#[derive(Debug, Clone)]
pub struct CallTracer {
    capacity: usize,
    records: VecDeque<HostCallRecord>,
    evicted: usize,
}

impl CallTracer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity.min(1024)),
            evicted: 0,
        }
    }

    pub fn record(&mut self, operation: &'static str, arguments: &[i64]) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.evicted += 1;
        }
        self.records.push_back(HostCallRecord {
            operation,
            arguments: arguments.to_vec(),
            anomaly: None,
        });
    }

    /// Attach an anomaly note to the most recent record.
    pub fn flag_last(&mut self, anomaly: impl Into<String>) {
        if let Some(last) = self.records.back_mut() {
            last.anomaly = Some(anomaly.into());
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.evicted = 0;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records dropped since the last clear.
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    pub fn dump(&self) -> Vec<HostCallRecord> {
        self.records.iter().cloned().collect()
    }
}

/// Numbered, one-call-per-line rendering of a call log.
pub fn render_calls(records: &[HostCallRecord]) -> String {
    let mut out = String::new();
    for (i, record) in records.iter().enumerate() {
        let args: Vec<String> = record.arguments.iter().map(i64::to_string).collect();
        let _ = write!(out, "  {}. {}({})", i + 1, record.operation, args.join(", "));
        if let Some(anomaly) = &record.anomaly {
            let _ = write!(out, " [{}]", anomaly);
        }
        out.push('\n');
    }
    out
}
