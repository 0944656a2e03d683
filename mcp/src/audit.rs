//! Audit logging for proxied tool calls.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_MAX_ENTRIES: usize = 10000;

/// Outcome of one proxied tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome {
    Success { status: u16 },
    UpstreamError { status: u16, body: String },
    TransportError { detail: String },
    SigningError { detail: String },
    InvalidArguments { detail: String },
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success { .. })
    }
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub app_code: String,
    pub server_id: i64,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
    /// Outbound headers with credential values masked.
    pub outbound_headers: Vec<(String, String)>,
    pub outcome: CallOutcome,
}

impl CallRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: String,
        app_code: String,
        server_id: i64,
        server_name: String,
        tool_name: String,
        arguments: Value,
        outbound_headers: Vec<(String, String)>,
        outcome: CallOutcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            request_id,
            app_code,
            server_id,
            server_name,
            tool_name,
            arguments,
            outbound_headers,
            outcome,
        }
    }
}

/// Thread-safe, bounded audit log for tool calls.
#[derive(Debug)]
pub struct CallAuditLog {
    entries: RwLock<VecDeque<CallRecord>>,
    max_entries: usize,
}

impl Default for CallAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CallAuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    pub fn record(&self, entry: CallRecord) {
        let mut entries = self.entries.write();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<CallRecord> {
        let entries = self.entries.read();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn for_request(&self, request_id: &str) -> Vec<CallRecord> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect()
    }

    pub fn for_app(&self, app_code: &str, limit: usize) -> Vec<CallRecord> {
        let entries = self.entries.read();
        entries
            .iter()
            .rev()
            .filter(|e| e.app_code == app_code)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(request_id: &str, app_code: &str, tool: &str) -> CallRecord {
        CallRecord::new(
            request_id.to_string(),
            app_code.to_string(),
            7,
            "demo".to_string(),
            tool.to_string(),
            json!({}),
            vec![],
            CallOutcome::Success { status: 200 },
        )
    }

    #[test]
    fn test_record_and_recent() {
        let log = CallAuditLog::new();
        log.record(record("r1", "app", "getUsers"));

        assert_eq!(log.len(), 1);
        let recent = log.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tool_name, "getUsers");
        assert!(recent[0].outcome.is_success());
    }

    #[test]
    fn test_capacity_cap() {
        let log = CallAuditLog::with_capacity(5);
        for i in 0..10 {
            log.record(record(&format!("r{}", i), "app", &format!("tool-{}", i)));
        }

        assert_eq!(log.len(), 5);
        let recent = log.recent(10);
        assert_eq!(recent[0].tool_name, "tool-9");
        assert_eq!(recent[4].tool_name, "tool-5");
    }

    #[test]
    fn test_filter_by_request_and_app() {
        let log = CallAuditLog::new();
        log.record(record("r1", "app-a", "t1"));
        log.record(record("r2", "app-b", "t2"));
        log.record(record("r1", "app-a", "t3"));

        assert_eq!(log.for_request("r1").len(), 2);
        assert_eq!(log.for_app("app-b", 10).len(), 1);
    }
}
