//! Read-only view of scheduler internals for debugging.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::SchedResult;
use crate::request::RequestId;

/// Queue contents and counters captured under the queue lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSnapshot {
    /// Queued reads in arrival order.
    pub read_fifo: Vec<RequestId>,
    /// Queued writes in arrival order.
    pub write_fifo: Vec<RequestId>,
    /// Read sector continuation cursor.
    pub read_next: Option<RequestId>,
    /// Write sector continuation cursor.
    pub write_next: Option<RequestId>,
    /// Consecutive reads chosen over an expired write.
    pub starved_writes: u32,
    /// Pre-staged dispatch list, head first.
    pub dispatch: Vec<RequestId>,
    /// Prepared requests not yet finished.
    pub allocated: u32,
    /// Prepared asynchronous writes not yet finished.
    pub async_writes: u32,
}

impl DebugSnapshot {
    /// Pretty-printed JSON.
    pub fn to_json(&self) -> SchedResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// One `name: value` line per field, ids space separated.
    pub fn render(&self) -> String {
        fn ids(list: &[RequestId]) -> String {
            list.iter()
                .map(|id| id.0.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        }
        fn cursor(id: Option<RequestId>) -> String {
            id.map(|id| id.0.to_string()).unwrap_or_default()
        }

        let mut out = String::new();
        let _ = writeln!(out, "read_fifo_list: {}", ids(&self.read_fifo));
        let _ = writeln!(out, "read_next_rq: {}", cursor(self.read_next));
        let _ = writeln!(out, "write_fifo_list: {}", ids(&self.write_fifo));
        let _ = writeln!(out, "write_next_rq: {}", cursor(self.write_next));
        let _ = writeln!(out, "starved_writes: {}", self.starved_writes);
        let _ = writeln!(out, "dispatch: {}", ids(&self.dispatch));
        let _ = writeln!(out, "allocated: {}", self.allocated);
        let _ = writeln!(out, "async_writes: {}", self.async_writes);
        out
    }
}
