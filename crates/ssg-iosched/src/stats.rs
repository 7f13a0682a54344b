//! Completion accounting: the statistics sink contract and two sinks.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::request::Tag;

/// Emitted once per finished request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// Tag the request held.
    pub tag: Tag,
    /// Bytes handed to hardware; zero if the request never dispatched.
    pub bytes: u64,
    /// Owning thread-group id.
    pub tgid: u32,
    /// Owning thread-group name.
    pub tg_name: String,
    /// Owning thread-group start time in nanoseconds.
    pub tg_start_time_ns: u64,
    /// Nanoseconds between prepare and finish.
    pub ownership_ns: u64,
}

/// Receives completion accounting events.
pub trait StatsSink: Send + Sync {
    /// Records one finished request.
    fn account_io_done(&self, event: &CompletionEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn account_io_done(&self, _event: &CompletionEvent) {}
}

/// Logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatsSink;

impl StatsSink for TracingStatsSink {
    fn account_io_done(&self, event: &CompletionEvent) {
        debug!(
            tgid = event.tgid,
            tg_name = %event.tg_name,
            bytes = event.bytes,
            ownership_ns = event.ownership_ns,
            "io done"
        );
    }
}

/// Per thread-group totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TgroupTotals {
    /// Thread-group name from the most recent event.
    pub name: String,
    /// Thread-group start time from the most recent event.
    pub start_time_ns: u64,
    /// Finished requests.
    pub requests: u64,
    /// Bytes transferred.
    pub bytes: u64,
    /// Summed ownership time.
    pub ownership_ns: u64,
}

/// Aggregates completion events per thread group.
#[derive(Debug, Default)]
pub struct TgroupIoStats {
    totals: DashMap<u32, TgroupTotals>,
}

impl TgroupIoStats {
    /// Creates an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals for `tgid`, if it has finished any request.
    pub fn get(&self, tgid: u32) -> Option<TgroupTotals> {
        self.totals.get(&tgid).map(|t| t.clone())
    }

    /// Number of thread groups seen.
    pub fn len(&self) -> usize {
        self.totals.len()
    }

    /// True when no event has been recorded.
    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Bytes summed over every thread group.
    pub fn total_bytes(&self) -> u64 {
        self.totals.iter().map(|t| t.bytes).sum()
    }

    /// Copies the aggregate out, ordered by tgid.
    pub fn snapshot(&self) -> Vec<(u32, TgroupTotals)> {
        let mut out: Vec<_> = self
            .totals
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        out.sort_by_key(|(tgid, _)| *tgid);
        out
    }
}

impl StatsSink for TgroupIoStats {
    fn account_io_done(&self, event: &CompletionEvent) {
        let mut totals = self.totals.entry(event.tgid).or_default();
        if totals.name != event.tg_name {
            totals.name = event.tg_name.clone();
        }
        totals.start_time_ns = event.tg_start_time_ns;
        totals.requests += 1;
        totals.bytes = totals.bytes.saturating_add(event.bytes);
        totals.ownership_ns = totals.ownership_ns.saturating_add(event.ownership_ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tgid: u32, bytes: u64) -> CompletionEvent {
        CompletionEvent {
            tag: Tag(0),
            bytes,
            tgid,
            tg_name: format!("proc{}", tgid),
            tg_start_time_ns: 10,
            ownership_ns: 100,
        }
    }

    #[test]
    fn test_tgroup_stats_aggregate() {
        let stats = TgroupIoStats::new();
        assert!(stats.is_empty());

        stats.account_io_done(&event(7, 4096));
        stats.account_io_done(&event(7, 8192));
        stats.account_io_done(&event(9, 512));

        assert_eq!(stats.len(), 2);
        let t7 = stats.get(7).unwrap();
        assert_eq!(t7.requests, 2);
        assert_eq!(t7.bytes, 12288);
        assert_eq!(t7.ownership_ns, 200);
        assert_eq!(t7.name, "proc7");
        assert_eq!(stats.total_bytes(), 12800);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let stats = TgroupIoStats::new();
        stats.account_io_done(&event(30, 1));
        stats.account_io_done(&event(10, 1));
        stats.account_io_done(&event(20, 1));
        let tgids: Vec<u32> = stats.snapshot().into_iter().map(|(t, _)| t).collect();
        assert_eq!(tgids, vec![10, 20, 30]);
    }

    #[test]
    fn test_null_and_tracing_sinks_accept_events() {
        NullStatsSink.account_io_done(&event(1, 1));
        TracingStatsSink.account_io_done(&event(1, 1));
    }
}
