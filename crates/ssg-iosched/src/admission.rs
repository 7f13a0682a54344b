//! Admission control: per-allocation shallow depth from three throttles.
//!
//! - cgroup: the submitting cgroup's instance has reached its in-flight limit
//! - async write: asynchronous writes in flight have reached their cap
//! - thread group: the submitter owns too many tags, checked only while the
//!   queue is congested because it scans the whole ledger
//!
//! The result is the smallest bound any of them imposes, or `None`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{SsgConfig, MAX_RATIO};
use crate::ledger::RequestLedger;
use crate::request::Direction;
use crate::tags::TagGeometry;

/// Limits derived from the tag geometry and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionLimits {
    /// Hardware tag depth.
    pub depth: u32,
    /// Allocated count above which the thread-group check runs.
    pub congestion_threshold_rqs: u32,
    /// Tags one thread group may hold before it is throttled.
    pub max_tgroup_rqs: u32,
    /// Per-word depth for throttled thread groups.
    pub tgroup_shallow_depth: u32,
    /// Asynchronous writes allowed in flight before throttling.
    pub max_async_write_rqs: u32,
    /// Per-word depth for throttled asynchronous writes.
    pub async_write_shallow_depth: u32,
}

impl AdmissionLimits {
    /// Derives the limits for `geometry`.
    pub fn compute(config: &SsgConfig, geometry: &TagGeometry) -> Self {
        let depth = geometry.depth;
        let pct = |ratio: u32| {
            (depth as u64 * ratio.min(MAX_RATIO) as u64 / MAX_RATIO as u64) as u32
        };

        let max_async_write_rqs = pct(config.max_async_write_ratio).min(config.max_async_write_rqs);
        let max_tgroup_rqs = pct(config.max_tgroup_io_ratio);
        Self {
            depth,
            congestion_threshold_rqs: pct(config.congestion_threshold_pct),
            max_tgroup_rqs,
            tgroup_shallow_depth: geometry.shallow_depth_for(max_tgroup_rqs),
            max_async_write_rqs,
            async_write_shallow_depth: geometry.shallow_depth_for(max_async_write_rqs),
        }
    }
}

/// Cost counters for the thread-group scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    /// Admission checks evaluated.
    pub evaluations: u64,
    /// Thread-group scans performed.
    pub tgroup_scans: u64,
    /// Ledger slots examined by those scans.
    pub slots_scanned: u64,
}

/// Keeps the allocation counters and computes shallow depths.
#[derive(Debug)]
pub struct AdmissionController {
    limits: RwLock<AdmissionLimits>,
    allocated: AtomicU32,
    async_writes: AtomicU32,
    evaluations: AtomicU64,
    tgroup_scans: AtomicU64,
    slots_scanned: AtomicU64,
}

/// `min` over the bounds that are set.
pub fn min_restrictive(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl AdmissionController {
    /// Creates a controller with zeroed counters.
    pub fn new(config: &SsgConfig, geometry: &TagGeometry) -> Self {
        Self {
            limits: RwLock::new(AdmissionLimits::compute(config, geometry)),
            allocated: AtomicU32::new(0),
            async_writes: AtomicU32::new(0),
            evaluations: AtomicU64::new(0),
            tgroup_scans: AtomicU64::new(0),
            slots_scanned: AtomicU64::new(0),
        }
    }

    /// Current derived limits.
    pub fn limits(&self) -> AdmissionLimits {
        *self.limits.read()
    }

    /// Recomputes the limits after a depth change. Counters are kept.
    pub fn update_geometry(&self, config: &SsgConfig, geometry: &TagGeometry) {
        let limits = AdmissionLimits::compute(config, geometry);
        *self.limits.write() = limits;
        debug!(
            "Admission limits: depth={}, congestion={}, tgroup={}/{}, async={}/{}",
            limits.depth,
            limits.congestion_threshold_rqs,
            limits.max_tgroup_rqs,
            limits.tgroup_shallow_depth,
            limits.max_async_write_rqs,
            limits.async_write_shallow_depth
        );
    }

    /// Prepared requests not yet finished.
    pub fn allocated(&self) -> u32 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Prepared asynchronous writes not yet finished.
    pub fn async_writes(&self) -> u32 {
        self.async_writes.load(Ordering::Relaxed)
    }

    pub(crate) fn on_prepare(&self, async_write: bool) {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        if async_write {
            self.async_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn on_finish(&self, async_write: bool) {
        saturating_dec(&self.allocated);
        if async_write {
            saturating_dec(&self.async_writes);
        }
    }

    /// Bound for an asynchronous write once the cap is reached.
    pub fn async_write_depth(&self, direction: Direction, sync: bool) -> Option<u32> {
        if direction != Direction::Write || sync {
            return None;
        }
        let limits = self.limits();
        if self.async_writes() < limits.max_async_write_rqs {
            return None;
        }
        Some(limits.async_write_shallow_depth)
    }

    /// Whether the thread-group check applies right now.
    pub fn is_congested(&self) -> bool {
        self.allocated() > self.limits().congestion_threshold_rqs
    }

    /// Bound for `tgid` once it holds `max_tgroup_rqs` tags. Scans the
    /// whole ledger.
    pub fn tgroup_depth(&self, tgid: u32, ledger: &RequestLedger) -> Option<u32> {
        let scan = ledger.count_owned_by(tgid);
        self.tgroup_scans.fetch_add(1, Ordering::Relaxed);
        self.slots_scanned
            .fetch_add(scan.scanned as u64, Ordering::Relaxed);

        let limits = self.limits();
        if scan.owned < limits.max_tgroup_rqs {
            return None;
        }
        Some(limits.tgroup_shallow_depth)
    }

    /// Combines the cgroup bound with the async-write and thread-group bounds.
    pub fn limit_depth(
        &self,
        cgroup_depth: Option<u32>,
        direction: Direction,
        sync: bool,
        tgid: u32,
        ledger: &RequestLedger,
    ) -> Option<u32> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let mut depth = min_restrictive(cgroup_depth, self.async_write_depth(direction, sync));
        if self.is_congested() {
            depth = min_restrictive(depth, self.tgroup_depth(tgid, ledger));
        }
        depth
    }

    /// Scan cost counters.
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            tgroup_scans: self.tgroup_scans.load(Ordering::Relaxed),
            slots_scanned: self.slots_scanned.load(Ordering::Relaxed),
        }
    }
}

fn saturating_dec(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}
