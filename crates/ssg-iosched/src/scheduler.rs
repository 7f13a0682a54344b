//! The SSG scheduler: deadline-aware dispatch with admission throttling.
//!
//! Requests queue per direction in sector and arrival order. Dispatch keeps
//! walking sector order until a deadline fires, prefers reads, and forces an
//! expired write through once reads have been chosen over it
//! `max_write_starvation` times. On zoned devices at most one write per
//! sequential zone is in flight.
//!
//! Lock order is queue state, then zone table. Completion takes the zone
//! table alone.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, AdmissionLimits, AdmissionStats};
use crate::cgroup::{CgroupThrottleRegistry, DeviceId};
use crate::clock::Clock;
use crate::config::SsgConfig;
use crate::elevator::{BioMergeOutcome, Elevator, ElevatorFeatures};
use crate::error::SchedResult;
use crate::introspect::DebugSnapshot;
use crate::ledger::{Preparation, RequestLedger};
use crate::ordered_queue::OrderedQueue;
use crate::request::{Bio, Direction, MergeKind, Request, RequestId, Submitter};
use crate::stats::StatsSink;
use crate::tags::TagGeometry;
use crate::tunables::{Attribute, Tunables};
use crate::zone::ZoneLockTable;

struct SchedState {
    queues: [OrderedQueue; 2],
    dispatch: VecDeque<Request>,
    starved_writes: u32,
    tunables: Tunables,
}

impl SchedState {
    #[inline]
    fn queue(&self, direction: Direction) -> &OrderedQueue {
        &self.queues[direction.as_index()]
    }

    #[inline]
    fn queue_mut(&mut self, direction: Direction) -> &mut OrderedQueue {
        &mut self.queues[direction.as_index()]
    }
}

/// Scheduler instance for one device queue.
pub struct SsgScheduler {
    device: DeviceId,
    config: SsgConfig,
    geometry: RwLock<TagGeometry>,
    state: Mutex<SchedState>,
    zones: Option<ZoneLockTable>,
    admission: AdmissionController,
    ledger: RequestLedger,
    registry: Arc<CgroupThrottleRegistry>,
    sink: Arc<dyn StatsSink>,
    clock: Arc<dyn Clock>,
}

impl SsgScheduler {
    /// Sets up the scheduler for `device` and registers the device with the
    /// cgroup registry.
    pub fn new(
        config: SsgConfig,
        device: DeviceId,
        geometry: TagGeometry,
        registry: Arc<CgroupThrottleRegistry>,
        sink: Arc<dyn StatsSink>,
        clock: Arc<dyn Clock>,
    ) -> SchedResult<Self> {
        let config = config.validated()?;
        let state = SchedState {
            queues: [
                OrderedQueue::new(Direction::Read),
                OrderedQueue::new(Direction::Write),
            ],
            dispatch: VecDeque::new(),
            starved_writes: 0,
            tunables: Tunables::from_config(&config),
        };
        registry.register_device(device, geometry);

        info!(
            "SSG scheduler on {}: depth={}, zoned={}, read_expire={}ms, write_expire={}ms",
            device,
            geometry.depth,
            config.is_zoned(),
            config.read_expire_ms,
            config.write_expire_ms
        );
        Ok(Self {
            device,
            zones: config.zoned.map(ZoneLockTable::new),
            admission: AdmissionController::new(&config, &geometry),
            ledger: RequestLedger::new(geometry.depth),
            geometry: RwLock::new(geometry),
            state: Mutex::new(state),
            config,
            registry,
            sink,
            clock,
        })
    }

    /// Device this scheduler serves.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Configuration the scheduler was built with.
    pub fn config(&self) -> &SsgConfig {
        &self.config
    }

    /// Current tag geometry.
    pub fn geometry(&self) -> TagGeometry {
        *self.geometry.read()
    }

    /// Cgroup registry shared with other queues.
    pub fn registry(&self) -> &Arc<CgroupThrottleRegistry> {
        &self.registry
    }

    /// Tag ownership ledger.
    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    /// Current admission limits.
    pub fn admission_limits(&self) -> AdmissionLimits {
        self.admission.limits()
    }

    /// Thread-group scan counters.
    pub fn admission_stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    /// Prepared requests not yet finished.
    pub fn allocated(&self) -> u32 {
        self.admission.allocated()
    }

    /// Requests queued in `direction`.
    pub fn queued(&self, direction: Direction) -> usize {
        self.state.lock().queue(direction).len()
    }

    /// Consecutive reads chosen over an expired write.
    pub fn starved_writes(&self) -> u32 {
        self.state.lock().starved_writes
    }

    /// Whether `zone` has a write in flight. Always false on conventional
    /// devices.
    pub fn is_zone_locked(&self, zone: u64) -> bool {
        self.zones.as_ref().is_some_and(|z| z.is_locked(zone))
    }

    /// Current writable attributes.
    pub fn tunables(&self) -> Tunables {
        self.state.lock().tunables
    }

    /// Shows attribute `name` as text.
    pub fn show_attribute(&self, name: &str) -> SchedResult<String> {
        let attr: Attribute = name.parse()?;
        let limits = self.admission.limits();
        let value = self.state.lock().tunables.show(attr, &limits);
        Ok(format!("{}\n", value))
    }

    /// Stores attribute `name` from text. Returns the clamped stored value.
    pub fn store_attribute(&self, name: &str, text: &str) -> SchedResult<i64> {
        let attr: Attribute = name.parse()?;
        self.state.lock().tunables.store(attr, text)
    }

    /// Captures queue contents and counters.
    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let st = self.state.lock();
        let ids = |dir: Direction| -> Vec<RequestId> {
            st.queue(dir).iter_fifo().map(|rq| rq.id).collect()
        };
        let snapshot = DebugSnapshot {
            read_fifo: ids(Direction::Read),
            write_fifo: ids(Direction::Write),
            read_next: st.queue(Direction::Read).next_cursor(),
            write_next: st.queue(Direction::Write).next_cursor(),
            starved_writes: st.starved_writes,
            dispatch: st.dispatch.iter().map(|rq| rq.id).collect(),
            allocated: self.admission.allocated(),
            async_writes: self.admission.async_writes(),
        };
        snapshot
    }

    fn zone_table(&self, direction: Direction) -> Option<&ZoneLockTable> {
        match direction {
            Direction::Write => self.zones.as_ref(),
            Direction::Read => None,
        }
    }

    /// Oldest dispatchable request of `direction`. Zoned writes whose zone is
    /// locked are skipped.
    fn fifo_candidate(&self, st: &SchedState, direction: Direction) -> Option<RequestId> {
        let queue = st.queue(direction);
        let Some(zones) = self.zone_table(direction) else {
            return queue.earliest_by_arrival().map(|rq| rq.id);
        };
        let locks = zones.lock();
        let found = queue
            .iter_fifo()
            .find(|rq| locks.can_dispatch(zones.geometry(), rq))
            .map(|rq| rq.id);
        found
    }

    /// Sector continuation of `direction`, walking past locked zones.
    fn next_candidate(&self, st: &SchedState, direction: Direction) -> Option<RequestId> {
        let queue = st.queue(direction);
        let cursor = queue.next_cursor()?;
        let Some(zones) = self.zone_table(direction) else {
            return Some(cursor);
        };
        let locks = zones.lock();
        let found = queue
            .iter_sorted_from(cursor)
            .find(|rq| locks.can_dispatch(zones.geometry(), rq))
            .map(|rq| rq.id);
        found
    }

    fn deadline_expired(st: &SchedState, direction: Direction, now_ns: u64) -> bool {
        st.queue(direction)
            .earliest_by_arrival()
            .is_some_and(|rq| now_ns >= rq.fifo_time_ns())
    }

    fn expired_write_waiting(&self, st: &SchedState, now_ns: u64) -> bool {
        let queue = st.queue(Direction::Write);
        self.fifo_candidate(st, Direction::Write)
            .and_then(|id| queue.get(id))
            .is_some_and(|rq| now_ns >= rq.fifo_time_ns())
    }

    fn select_direction(&self, st: &mut SchedState, now_ns: u64) -> Option<Direction> {
        if !st.queue(Direction::Read).is_empty() {
            if self.expired_write_waiting(st, now_ns) {
                let starved =
                    st.starved_writes as i64 >= st.tunables.max_write_starvation as i64;
                st.starved_writes = st.starved_writes.saturating_add(1);
                if starved {
                    debug!("Forcing write after {} starved reads", st.starved_writes - 1);
                    st.starved_writes = 0;
                    return Some(Direction::Write);
                }
            }
            return Some(Direction::Read);
        }
        if !st.queue(Direction::Write).is_empty() {
            st.starved_writes = 0;
            return Some(Direction::Write);
        }
        None
    }

    fn dispatch_locked(&self, st: &mut SchedState, now_ns: u64) -> Option<Request> {
        if let Some(mut rq) = st.dispatch.pop_front() {
            self.start_request(&mut rq);
            return Some(rq);
        }

        let direction = self.select_direction(st, now_ns)?;
        let next = self.next_candidate(st, direction);
        let chosen = if Self::deadline_expired(st, direction, now_ns) || next.is_none() {
            self.fifo_candidate(st, direction)
        } else {
            next
        };
        let Some(id) = chosen else {
            debug!("No dispatchable {} request, all target zones locked", direction);
            return None;
        };

        for dir in Direction::ALL {
            st.queue_mut(dir).clear_cursor();
        }
        let mut rq = st.queue_mut(direction).take_for_dispatch(id);
        self.start_request(&mut rq);
        Some(rq)
    }

    fn start_request(&self, rq: &mut Request) {
        if let Some(zones) = &self.zones {
            zones.lock().write_lock(zones.geometry(), rq);
        }
        rq.started = true;
    }

    fn front_merge_target(queue: &OrderedQueue, bio: &Bio, max_sectors: u32) -> Option<RequestId> {
        let id = queue.find_front_merge(bio.end_sector())?;
        queue
            .get(id)
            .filter(|rq| rq.can_merge_bio(bio, max_sectors))
            .map(|rq| rq.id)
    }

    fn insert_merge_target(
        queue: &OrderedQueue,
        rq: &Request,
        max_sectors: u32,
    ) -> Option<RequestId> {
        if !rq.mergeable || rq.passthrough {
            return None;
        }
        let id = queue.find_back_merge(rq.sector)?;
        queue
            .get(id)
            .filter(|target| target.can_absorb(rq, max_sectors))
            .map(|target| target.id)
    }

    /// After `id` grew at its end, lets it absorb its sector-successor.
    fn merge_with_successor(
        queue: &mut OrderedQueue,
        id: RequestId,
        max_sectors: u32,
    ) -> Option<Request> {
        let next = {
            let rq = queue.get(id)?;
            let next = queue.successor_by_sector(id)?;
            rq.can_absorb(next, max_sectors).then_some(next.id)
        }?;
        Some(queue.requests_merged(id, next))
    }

    /// After `id` grew at its front, lets its sector-predecessor absorb it.
    fn merge_into_predecessor(
        queue: &mut OrderedQueue,
        id: RequestId,
        max_sectors: u32,
    ) -> Option<(RequestId, Request)> {
        let prev = {
            let rq = queue.get(id)?;
            let prev = queue.predecessor_by_sector(id)?;
            prev.can_absorb(rq, max_sectors).then_some(prev.id)
        }?;
        Some((prev, queue.requests_merged(prev, id)))
    }
}

impl Elevator for SsgScheduler {
    fn name(&self) -> &'static str {
        "ssg"
    }

    fn features(&self) -> ElevatorFeatures {
        ElevatorFeatures {
            zoned: self.zones.is_some(),
        }
    }

    fn limit_depth(&self, direction: Direction, sync: bool, submitter: &Submitter) -> Option<u32> {
        let cgroup_depth = self.registry.shallow_depth(submitter.cgroup, self.device);
        let depth = self.admission.limit_depth(
            cgroup_depth,
            direction,
            sync,
            submitter.tgid,
            &self.ledger,
        );
        if let Some(depth) = depth {
            debug!(
                "Limiting {} {} from tgid={} to shallow depth {}",
                if sync { "sync" } else { "async" },
                direction,
                submitter.tgid,
                depth
            );
        }
        depth
    }

    fn prepare_request(&self, rq: &mut Request, submitter: &Submitter) {
        assert!(!rq.prepared, "request {:?} prepared twice", rq.id);
        let now = self.clock.now_ns();
        self.admission.on_prepare(rq.is_async_write());
        if let Some(tag) = rq.tag {
            let cgroup = self.registry.lookup(submitter.cgroup, self.device);
            let outcome = self.ledger.prepare(tag, submitter, cgroup.clone(), now);
            if let Preparation::Displaced(old) = &outcome {
                CgroupThrottleRegistry::dec(old.cgroup.as_ref());
            }
            if outcome.is_recorded() {
                CgroupThrottleRegistry::inc(cgroup.as_ref());
            }
            debug_assert!(
                !matches!(outcome, Preparation::Displaced(_)),
                "{:?} prepared while still owned",
                tag
            );
        }
        rq.prepared = true;
    }

    fn insert_requests(&self, rqs: Vec<Request>, at_head: bool) -> Vec<Request> {
        let now = self.clock.now_ns();
        let max_sectors = self.config.max_merge_sectors;
        let mut freed = Vec::new();

        let mut st = self.state.lock();
        for mut rq in rqs {
            // A requeued write may still hold its zone.
            if let Some(zones) = &self.zones {
                zones.lock().write_unlock(zones.geometry(), &mut rq);
            }
            rq.started = false;

            let direction = rq.direction;
            if let Some(target) = Self::insert_merge_target(st.queue(direction), &rq, max_sectors) {
                let bio = Bio::new(direction, rq.sector, rq.nr_sectors, rq.sync);
                st.queue_mut(direction).extend_back(target, &bio);
                debug!("Insert-merged {:?} into {:?}", rq.id, target);
                freed.push(rq);
                continue;
            }

            if at_head {
                st.dispatch.push_front(rq);
            } else if rq.passthrough {
                st.dispatch.push_back(rq);
            } else {
                let deadline = now.saturating_add(st.tunables.fifo_expire_ns(direction));
                st.queue_mut(direction).insert(rq, deadline);
            }
        }
        freed
    }

    fn dispatch_request(&self) -> Option<Request> {
        let now = self.clock.now_ns();
        let rq = {
            let mut st = self.state.lock();
            self.dispatch_locked(&mut st, now)
        }?;
        if let Some(tag) = rq.tag {
            self.ledger.record_dispatch_size(tag, rq.bytes());
        }
        debug!(
            "Dispatching {:?}: {} sector={} len={}",
            rq.id, rq.direction, rq.sector, rq.nr_sectors
        );
        Some(rq)
    }

    fn finish_request(&self, rq: &mut Request) -> bool {
        let mut restart = false;
        if let Some(zones) = &self.zones {
            zones.lock().write_unlock(zones.geometry(), rq);
            restart = !self.state.lock().queue(Direction::Write).is_empty();
        }

        if !rq.prepared {
            return restart;
        }
        rq.prepared = false;
        self.admission.on_finish(rq.is_async_write());

        if let Some(tag) = rq.tag {
            let now = self.clock.now_ns();
            if let Some(entry) = self.ledger.finish(tag, now, self.sink.as_ref()) {
                CgroupThrottleRegistry::dec(entry.cgroup.as_ref());
            }
        }
        restart
    }

    fn request_merge(&self, bio: &Bio) -> Option<(RequestId, MergeKind)> {
        let st = self.state.lock();
        if !st.tunables.front_merges {
            return None;
        }
        Self::front_merge_target(st.queue(bio.direction), bio, self.config.max_merge_sectors)
            .map(|id| (id, MergeKind::Front))
    }

    fn bio_merge(&self, bio: &Bio) -> BioMergeOutcome {
        let max_sectors = self.config.max_merge_sectors;
        let mut st = self.state.lock();
        let front_merges = st.tunables.front_merges;
        let queue = st.queue_mut(bio.direction);

        if let Some(id) = queue.find_back_merge(bio.sector) {
            if queue.get(id).is_some_and(|rq| rq.can_merge_bio(bio, max_sectors)) {
                queue.extend_back(id, bio);
                let freed = Self::merge_with_successor(queue, id, max_sectors);
                debug!("Back-merged bio at sector {} into {:?}", bio.sector, id);
                return BioMergeOutcome {
                    merged: Some((id, MergeKind::Back)),
                    freed,
                };
            }
        }

        if !front_merges {
            return BioMergeOutcome::default();
        }
        let Some(id) = Self::front_merge_target(queue, bio, max_sectors) else {
            return BioMergeOutcome::default();
        };
        queue.reposition_after_front_merge(id, bio);
        debug!("Front-merged bio at sector {} into {:?}", bio.sector, id);
        match Self::merge_into_predecessor(queue, id, max_sectors) {
            Some((survivor, absorbed)) => BioMergeOutcome {
                merged: Some((survivor, MergeKind::Front)),
                freed: Some(absorbed),
            },
            None => BioMergeOutcome {
                merged: Some((id, MergeKind::Front)),
                freed: None,
            },
        }
    }

    fn requests_merged(&self, survivor: RequestId, absorbed: RequestId) -> Option<Request> {
        let max_sectors = self.config.max_merge_sectors;
        let mut st = self.state.lock();
        for direction in Direction::ALL {
            let queue = st.queue_mut(direction);
            let mergeable = match (queue.get(survivor), queue.get(absorbed)) {
                (Some(s), Some(a)) => s.can_absorb(a, max_sectors),
                _ => continue,
            };
            if !mergeable {
                return None;
            }
            return Some(queue.requests_merged(survivor, absorbed));
        }
        None
    }

    fn remove_request(&self, id: RequestId) -> Option<Request> {
        let mut st = self.state.lock();
        for direction in Direction::ALL {
            if let Some(rq) = st.queue_mut(direction).remove(id) {
                return Some(rq);
            }
        }
        let pos = st.dispatch.iter().position(|rq| rq.id == id)?;
        st.dispatch.remove(pos)
    }

    fn has_work(&self) -> bool {
        let st = self.state.lock();
        !st.dispatch.is_empty()
            || !st.queue(Direction::Read).is_empty()
            || !st.queue(Direction::Write).is_empty()
    }

    fn depth_updated(&self, geometry: TagGeometry) {
        *self.geometry.write() = geometry;
        self.admission.update_geometry(&self.config, &geometry);
        self.ledger.resize(geometry.depth);
        self.registry.on_hardware_depth_change(self.device, geometry);
        info!(
            "Depth updated on {}: depth={}, map_nr={}",
            self.device,
            geometry.depth,
            geometry.map_nr()
        );
    }

    fn exit_sched(&self) {
        let pending = {
            let st = self.state.lock();
            st.queue(Direction::Read).len() + st.queue(Direction::Write).len()
        };
        if pending > 0 {
            warn!("Exiting scheduler on {} with {} queued requests", self.device, pending);
        }
        debug_assert_eq!(pending, 0, "scheduler exited with queued requests");
        self.registry.detach_device(self.device);
        info!("SSG scheduler on {} exited", self.device);
    }
}
