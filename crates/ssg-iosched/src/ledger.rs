//! Per-tag ownership records for fairness accounting and completion stats.
//!
//! One slot per hardware tag. A tag has at most one owner at a time, so each
//! slot has a single writer; the owning tgid is atomic so the fairness scan
//! reads it without taking any slot lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cgroup::CgroupThrottleInstance;
use crate::request::{Submitter, Tag};
use crate::stats::{CompletionEvent, StatsSink};

const EMPTY_TGID: u64 = u64::MAX;

/// Attribution recorded for one prepared request.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Owning thread-group id.
    pub tgid: u32,
    /// Thread-group name, at most 15 characters.
    pub tg_name: String,
    /// Thread-group start time.
    pub tg_start_time_ns: u64,
    /// Cgroup instance charged for the request.
    pub cgroup: Option<Arc<CgroupThrottleInstance>>,
    /// Bytes handed to hardware; zero until dispatch.
    pub data_size: u64,
    /// Clock time at prepare.
    pub prepared_at_ns: u64,
}

#[derive(Debug)]
struct LedgerSlot {
    tgid: AtomicU64,
    entry: Mutex<Option<LedgerEntry>>,
}

impl LedgerSlot {
    fn empty() -> Self {
        Self {
            tgid: AtomicU64::new(EMPTY_TGID),
            entry: Mutex::new(None),
        }
    }
}

/// Result of a thread-group ownership scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipScan {
    /// Slots owned by the thread group.
    pub owned: u32,
    /// Slots examined.
    pub scanned: u32,
}

/// Outcome of [`RequestLedger::prepare`].
#[derive(Debug)]
pub enum Preparation {
    /// The tag is beyond the ledger depth; nothing was recorded.
    Missed,
    /// The slot was empty and now holds the new owner.
    Recorded,
    /// The slot was still owned; the previous record is returned.
    Displaced(LedgerEntry),
}

impl Preparation {
    /// Whether the new owner was recorded.
    pub fn is_recorded(&self) -> bool {
        !matches!(self, Preparation::Missed)
    }
}

/// Tag-indexed ownership table.
#[derive(Debug)]
pub struct RequestLedger {
    slots: RwLock<Vec<LedgerSlot>>,
}

impl RequestLedger {
    /// Creates a ledger with `depth` empty slots.
    pub fn new(depth: u32) -> Self {
        Self {
            slots: RwLock::new((0..depth).map(|_| LedgerSlot::empty()).collect()),
        }
    }

    /// Number of slots.
    pub fn depth(&self) -> u32 {
        self.slots.read().len() as u32
    }

    /// Records ownership of `tag`. A tag outside the ledger is ignored.
    /// Preparing a tag that is still owned replaces the record and hands the
    /// old one back so its cgroup charge can be released.
    pub fn prepare(
        &self,
        tag: Tag,
        submitter: &Submitter,
        cgroup: Option<Arc<CgroupThrottleInstance>>,
        now_ns: u64,
    ) -> Preparation {
        let slots = self.slots.read();
        let Some(slot) = slots.get(tag.as_index()) else {
            debug!("Ledger miss on prepare: {:?} beyond depth {}", tag, slots.len());
            return Preparation::Missed;
        };
        let mut entry = slot.entry.lock();
        let displaced = entry.replace(LedgerEntry {
            tgid: submitter.tgid,
            tg_name: submitter.stored_name(),
            tg_start_time_ns: submitter.start_time_ns,
            cgroup,
            data_size: 0,
            prepared_at_ns: now_ns,
        });
        slot.tgid.store(submitter.tgid as u64, Ordering::Release);
        match displaced {
            Some(old) => {
                warn!(
                    "Ledger slot for {:?} prepared while still owned by tgid={}",
                    tag, old.tgid
                );
                Preparation::Displaced(old)
            }
            None => Preparation::Recorded,
        }
    }

    /// Records the byte count handed to hardware for `tag`.
    pub fn record_dispatch_size(&self, tag: Tag, bytes: u64) {
        let slots = self.slots.read();
        let Some(slot) = slots.get(tag.as_index()) else {
            return;
        };
        let mut entry = slot.entry.lock();
        if let Some(entry) = entry.as_mut() {
            entry.data_size = bytes;
        }
    }

    /// Emits the completion event for `tag` to `sink`, then clears the slot.
    /// Returns the cleared entry; `None` when the slot was not owned.
    pub fn finish(&self, tag: Tag, now_ns: u64, sink: &dyn StatsSink) -> Option<LedgerEntry> {
        let slots = self.slots.read();
        let slot = slots.get(tag.as_index())?;
        let entry = slot.entry.lock().take()?;
        slot.tgid.store(EMPTY_TGID, Ordering::Release);

        sink.account_io_done(&CompletionEvent {
            tag,
            bytes: entry.data_size,
            tgid: entry.tgid,
            tg_name: entry.tg_name.clone(),
            tg_start_time_ns: entry.tg_start_time_ns,
            ownership_ns: now_ns.saturating_sub(entry.prepared_at_ns),
        });
        Some(entry)
    }

    /// Counts slots owned by `tgid`. Always examines every slot.
    pub fn count_owned_by(&self, tgid: u32) -> OwnershipScan {
        let slots = self.slots.read();
        let owned = slots
            .iter()
            .filter(|slot| slot.tgid.load(Ordering::Acquire) == tgid as u64)
            .count() as u32;
        OwnershipScan {
            owned,
            scanned: slots.len() as u32,
        }
    }

    /// Copy of the entry for `tag`.
    pub fn entry(&self, tag: Tag) -> Option<LedgerEntry> {
        let slots = self.slots.read();
        let slot = slots.get(tag.as_index())?;
        let entry = slot.entry.lock().clone();
        entry
    }

    /// Number of owned slots.
    pub fn live_count(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|slot| slot.tgid.load(Ordering::Acquire) != EMPTY_TGID)
            .count()
    }

    /// Reallocates the table for a new depth. Existing records are dropped;
    /// their later `finish` calls become misses.
    pub fn resize(&self, depth: u32) {
        let mut slots = self.slots.write();
        let live = slots
            .iter()
            .filter(|slot| slot.tgid.load(Ordering::Acquire) != EMPTY_TGID)
            .count();
        if live > 0 {
            warn!("Resizing ledger to {} with {} live slots", depth, live);
        }
        *slots = (0..depth).map(|_| LedgerSlot::empty()).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupId;
    use crate::stats::TgroupIoStats;

    fn submitter(tgid: u32) -> Submitter {
        Submitter::new(tgid, "a-rather-long-process-name", 42, CgroupId::ROOT)
    }

    #[test]
    fn test_prepare_and_finish_emit_event() {
        let ledger = RequestLedger::new(8);
        let stats = TgroupIoStats::new();

        ledger.prepare(Tag(3), &submitter(100), None, 1_000);
        ledger.record_dispatch_size(Tag(3), 4096);
        let entry = ledger.entry(Tag(3)).unwrap();
        assert_eq!(entry.tg_name.len(), 15);
        assert_eq!(entry.data_size, 4096);

        let cleared = ledger.finish(Tag(3), 6_000, &stats).unwrap();
        assert_eq!(cleared.tgid, 100);
        assert!(ledger.entry(Tag(3)).is_none());
        assert_eq!(ledger.live_count(), 0);

        let totals = stats.get(100).unwrap();
        assert_eq!(totals.bytes, 4096);
        assert_eq!(totals.ownership_ns, 5_000);
        assert_eq!(totals.start_time_ns, 42);
    }

    #[test]
    fn test_undispatched_request_reports_zero_bytes() {
        let ledger = RequestLedger::new(4);
        let stats = TgroupIoStats::new();
        ledger.prepare(Tag(0), &submitter(7), None, 0);
        ledger.finish(Tag(0), 10, &stats);
        assert_eq!(stats.get(7).unwrap().bytes, 0);
    }

    #[test]
    fn test_misses_are_noops() {
        let ledger = RequestLedger::new(4);
        let stats = TgroupIoStats::new();
        assert!(!ledger.prepare(Tag(9), &submitter(1), None, 0).is_recorded());
        ledger.record_dispatch_size(Tag(9), 512);
        assert!(ledger.finish(Tag(9), 0, &stats).is_none());
        assert!(ledger.finish(Tag(1), 0, &stats).is_none());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_prepare_over_live_slot_returns_previous_owner() {
        let ledger = RequestLedger::new(4);
        let stats = TgroupIoStats::new();
        assert!(matches!(
            ledger.prepare(Tag(1), &submitter(10), None, 0),
            Preparation::Recorded
        ));
        match ledger.prepare(Tag(1), &submitter(11), None, 5) {
            Preparation::Displaced(old) => assert_eq!(old.tgid, 10),
            other => panic!("expected displaced entry, got {:?}", other),
        }
        assert_eq!(ledger.count_owned_by(10).owned, 0);
        assert_eq!(ledger.count_owned_by(11).owned, 1);
        assert_eq!(ledger.finish(Tag(1), 9, &stats).unwrap().tgid, 11);
        assert!(stats.get(10).is_none());
    }

    #[test]
    fn test_finish_twice_emits_once() {
        let ledger = RequestLedger::new(4);
        let stats = TgroupIoStats::new();
        ledger.prepare(Tag(2), &submitter(5), None, 0);
        assert!(ledger.finish(Tag(2), 1, &stats).is_some());
        assert!(ledger.finish(Tag(2), 2, &stats).is_none());
        assert_eq!(stats.get(5).unwrap().requests, 1);
    }

    #[test]
    fn test_count_owned_by_scans_every_slot() {
        let ledger = RequestLedger::new(16);
        ledger.prepare(Tag(0), &submitter(7), None, 0);
        ledger.prepare(Tag(5), &submitter(7), None, 0);
        ledger.prepare(Tag(6), &submitter(8), None, 0);

        let scan = ledger.count_owned_by(7);
        assert_eq!(scan.owned, 2);
        assert_eq!(scan.scanned, 16);
        assert_eq!(ledger.count_owned_by(0).owned, 0);
    }

    #[test]
    fn test_resize_drops_records() {
        let ledger = RequestLedger::new(4);
        ledger.prepare(Tag(1), &submitter(3), None, 0);
        ledger.resize(8);
        assert_eq!(ledger.depth(), 8);
        assert_eq!(ledger.live_count(), 0);
        assert!(ledger.finish(Tag(1), 0, &crate::stats::NullStatsSink).is_none());
    }
}
