//! Execution ledger: bounded, append-only record of tool invocations.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Outcome of one top-level tool invocation.
///
/// Appended exactly once per invocation; failed retry attempts are folded
/// into `retry_count` rather than producing records of their own.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    pub tool_name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub retry_count: u32,
    pub success: bool,
}

impl InvocationRecord {
    pub fn success(
        tool_name: impl Into<String>,
        input: Value,
        output: Value,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        retry_count: u32,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
            output: Some(output),
            error_kind: None,
            error_message: None,
            started_at,
            duration_ms,
            retry_count,
            success: true,
        }
    }

    pub fn failure(
        tool_name: impl Into<String>,
        input: Value,
        error_kind: ErrorKind,
        error_message: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        retry_count: u32,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
            output: None,
            error_kind: Some(error_kind),
            error_message: Some(error_message.into()),
            started_at,
            duration_ms,
            retry_count,
            success: false,
        }
    }
}

/// Bounded in-memory ring of invocation records.
///
/// Appends are serialized by the mutex; read order is insertion order, never
/// reshuffled. The oldest records are evicted once capacity is exceeded.
pub struct ExecutionLedger {
    records: Mutex<VecDeque<Arc<InvocationRecord>>>,
    capacity: usize,
}

impl ExecutionLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Appends a record, evicting the oldest if full. Returns the shared
    /// handle also referenced from the dispatch result.
    pub fn append(&self, record: InvocationRecord) -> Arc<InvocationRecord> {
        let record = Arc::new(record);
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(Arc::clone(&record));
        record
    }

    /// Up to `n` records, most recent first.
    pub fn recent(&self, n: usize) -> Vec<Arc<InvocationRecord>> {
        let records = self.records.lock();
        records.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ExecutionLedger {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(tool: &str) -> InvocationRecord {
        InvocationRecord::success(tool, json!({}), json!(null), Utc::now(), 1, 0)
    }

    #[test]
    fn test_append_and_recent_order() {
        let ledger = ExecutionLedger::new(10);
        ledger.append(record("a"));
        ledger.append(record("b"));
        ledger.append(record("c"));

        let recent = ledger.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].tool_name, "c");
        assert_eq!(recent[1].tool_name, "b");
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let ledger = ExecutionLedger::new(3);
        for name in ["a", "b", "c", "d", "e"] {
            ledger.append(record(name));
        }

        assert_eq!(ledger.len(), 3);
        let recent = ledger.recent(10);
        let names: Vec<_> = recent.iter().map(|r| r.tool_name.as_str()).collect();
        assert_eq!(names, vec!["e", "d", "c"]);
    }

    #[test]
    fn test_failure_record_serialization() {
        let record = InvocationRecord::failure(
            "http_call",
            json!({"url": "https://x"}),
            ErrorKind::NetworkTimeout,
            "timed out",
            Utc::now(),
            30_000,
            2,
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_kind"], "network_timeout");
        assert_eq!(json["retry_count"], 2);
        assert!(json.get("output").is_none());
    }

    #[test]
    fn test_concurrent_appends_are_totally_ordered() {
        let ledger = Arc::new(ExecutionLedger::new(1000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    ledger.append(record("t"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.len(), 400);
    }
}
