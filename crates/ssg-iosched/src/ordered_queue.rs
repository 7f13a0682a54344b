//! Per-direction pending request queue with sector and arrival indices.
//!
//! Requests live in an arena keyed by [`RequestId`]; two ordered indices hold
//! only ids. The sector index is keyed by `(sector, insertion sequence)` so
//! equal sectors never collide and the earliest inserted wins a lookup. The
//! arrival index is keyed by a FIFO sequence that a merge may hand from the
//! absorbed request to the survivor.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use tracing::debug;

use crate::request::{Bio, Direction, Request, RequestId};

type SortKey = (u64, u64);

#[derive(Debug)]
struct Entry {
    rq: Request,
    sort_seq: u64,
    fifo_seq: u64,
}

impl Entry {
    #[inline]
    fn sort_key(&self) -> SortKey {
        (self.rq.sector, self.sort_seq)
    }
}

/// Pending requests of one direction.
#[derive(Debug)]
pub struct OrderedQueue {
    direction: Direction,
    entries: HashMap<RequestId, Entry>,
    sorted: BTreeMap<SortKey, RequestId>,
    fifo: BTreeMap<u64, RequestId>,
    by_end: HashMap<u64, Vec<RequestId>>,
    next: Option<RequestId>,
    next_floor: Option<SortKey>,
    seq: u64,
}

impl OrderedQueue {
    /// Creates an empty queue for `direction`.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            entries: HashMap::new(),
            sorted: BTreeMap::new(),
            fifo: BTreeMap::new(),
            by_end: HashMap::new(),
            next: None,
            next_floor: None,
            seq: 0,
        }
    }

    /// Direction served by this queue.
    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Number of queued requests.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is queued here.
    #[inline]
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Looks up a queued request.
    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.entries.get(&id).map(|e| &e.rq)
    }

    /// Queues `rq` under both indices with deadline `fifo_time_ns`.
    pub fn insert(&mut self, mut rq: Request, fifo_time_ns: u64) {
        assert_eq!(
            rq.direction, self.direction,
            "request {:?} inserted into {} queue",
            rq.id, self.direction
        );
        assert!(
            !self.entries.contains_key(&rq.id),
            "request {:?} inserted twice",
            rq.id
        );

        rq.fifo_time_ns = fifo_time_ns;
        let seq = self.next_seq();
        let entry = Entry {
            rq,
            sort_seq: seq,
            fifo_seq: seq,
        };
        let id = entry.rq.id;
        self.sorted.insert(entry.sort_key(), id);
        self.fifo.insert(seq, id);
        if entry.rq.mergeable {
            self.by_end.entry(entry.rq.end_sector()).or_default().push(id);
        }
        self.entries.insert(id, entry);
    }

    /// Unlinks `id` from both indices and returns it. Returns `None` for a
    /// request that is not queued here.
    pub fn remove(&mut self, id: RequestId) -> Option<Request> {
        if self.next == Some(id) {
            self.next = self.successor_id(id);
        }
        let entry = self.entries.remove(&id)?;
        self.sorted.remove(&entry.sort_key());
        self.fifo.remove(&entry.fifo_seq);
        self.unhash(id, entry.rq.end_sector());
        Some(entry.rq)
    }

    /// Oldest queued request.
    pub fn earliest_by_arrival(&self) -> Option<&Request> {
        self.fifo.values().next().and_then(|id| self.get(*id))
    }

    /// Lowest-sector queued request.
    pub fn first_by_sector(&self) -> Option<&Request> {
        self.sorted.values().next().and_then(|id| self.get(*id))
    }

    /// Request following `id` in sector order.
    pub fn successor_by_sector(&self, id: RequestId) -> Option<&Request> {
        self.successor_id(id).and_then(|next| self.get(next))
    }

    /// Request preceding `id` in sector order.
    pub fn predecessor_by_sector(&self, id: RequestId) -> Option<&Request> {
        let key = self.entries.get(&id)?.sort_key();
        self.sorted
            .range(..key)
            .next_back()
            .and_then(|(_, prev)| self.get(*prev))
    }

    fn successor_id(&self, id: RequestId) -> Option<RequestId> {
        let key = self.entries.get(&id)?.sort_key();
        self.first_after(key)
    }

    fn first_after(&self, key: SortKey) -> Option<RequestId> {
        self.sorted
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, id)| *id)
    }

    /// Requests in arrival order.
    pub fn iter_fifo(&self) -> impl Iterator<Item = &Request> + '_ {
        self.fifo.values().filter_map(move |id| self.get(*id))
    }

    /// Requests in sector order.
    pub fn iter_sorted(&self) -> impl Iterator<Item = &Request> + '_ {
        self.sorted.values().filter_map(move |id| self.get(*id))
    }

    /// Requests in sector order starting at `id` inclusive.
    pub fn iter_sorted_from(&self, id: RequestId) -> impl Iterator<Item = &Request> + '_ {
        let start = self.entries.get(&id).map(|e| e.sort_key());
        start
            .into_iter()
            .flat_map(move |key| self.sorted.range(key..))
            .filter_map(move |(_, id)| self.get(*id))
    }

    /// Cached sector-successor of the last dispatched request.
    #[inline]
    pub fn next_cursor(&self) -> Option<RequestId> {
        self.next
    }

    /// Clears the sector continuation cursor.
    pub fn clear_cursor(&mut self) {
        self.next = None;
        self.next_floor = None;
    }

    /// Removes `id` as the dispatched request: the cursor moves to its
    /// sector-successor.
    pub(crate) fn take_for_dispatch(&mut self, id: RequestId) -> Request {
        let entry = self
            .entries
            .get(&id)
            .unwrap_or_else(|| panic!("dispatching {:?} which is not queued", id));
        let floor = entry.sort_key();
        let next = self.first_after(floor);
        let rq = self
            .remove(id)
            .unwrap_or_else(|| panic!("dispatching {:?} which is not queued", id));
        self.next = next;
        self.next_floor = Some(floor);
        rq
    }

    /// Queued request starting exactly at `sector`, earliest inserted first.
    pub fn find_front_merge(&self, sector: u64) -> Option<RequestId> {
        self.sorted
            .range((sector, 0)..=(sector, u64::MAX))
            .next()
            .map(|(_, id)| *id)
    }

    /// Mergeable queued request ending exactly at `sector`.
    pub fn find_back_merge(&self, sector: u64) -> Option<RequestId> {
        self.by_end.get(&sector).and_then(|ids| ids.first().copied())
    }

    /// Appends `bio` to the end of `id`. The sector key is unchanged.
    pub fn extend_back(&mut self, id: RequestId, bio: &Bio) {
        let entry = self
            .entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("back merge into {:?} which is not queued", id));
        assert_eq!(entry.rq.end_sector(), bio.sector, "back merge must be contiguous");
        let old_end = entry.rq.end_sector();
        entry.rq.nr_sectors += bio.nr_sectors;
        let new_end = entry.rq.end_sector();
        self.rehash(id, old_end, new_end);
    }

    /// Prepends `bio` to `id` and re-sorts it. Arrival position and deadline
    /// are kept. A sector continuation cursor that the moved request now
    /// precedes is re-pointed at it.
    pub fn reposition_after_front_merge(&mut self, id: RequestId, bio: &Bio) {
        let entry = self
            .entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("front merge into {:?} which is not queued", id));
        assert_eq!(bio.end_sector(), entry.rq.sector, "front merge must be contiguous");
        let old_key = entry.sort_key();
        entry.rq.sector = bio.sector;
        entry.rq.nr_sectors += bio.nr_sectors;
        let new_key = entry.sort_key();

        self.sorted.remove(&old_key);
        self.sorted.insert(new_key, id);
        self.recompute_cursor();
        debug!(
            "Front merge repositioned {:?} in {} queue: sector {} -> {}",
            id, self.direction, old_key.0, new_key.0
        );
    }

    /// Merges `absorbed` into `survivor`, which must end where `absorbed`
    /// starts. The survivor keeps the earlier deadline and the earlier
    /// arrival position; the absorbed request is unlinked and returned.
    pub fn requests_merged(&mut self, survivor: RequestId, absorbed: RequestId) -> Request {
        let absorbed_fifo_seq = self
            .entries
            .get(&absorbed)
            .map(|e| e.fifo_seq)
            .unwrap_or_else(|| panic!("merging {:?} which is not queued", absorbed));
        let rq = self
            .remove(absorbed)
            .unwrap_or_else(|| panic!("merging {:?} which is not queued", absorbed));

        let entry = self
            .entries
            .get_mut(&survivor)
            .unwrap_or_else(|| panic!("merging into {:?} which is not queued", survivor));
        assert_eq!(
            entry.rq.end_sector(),
            rq.sector,
            "merged requests must be contiguous"
        );
        let old_end = entry.rq.end_sector();
        entry.rq.nr_sectors += rq.nr_sectors;
        let new_end = entry.rq.end_sector();
        entry.rq.fifo_time_ns = entry.rq.fifo_time_ns.min(rq.fifo_time_ns);
        if absorbed_fifo_seq < entry.fifo_seq {
            let old_seq = entry.fifo_seq;
            entry.fifo_seq = absorbed_fifo_seq;
            self.fifo.remove(&old_seq);
            self.fifo.insert(absorbed_fifo_seq, survivor);
        }
        self.rehash(survivor, old_end, new_end);

        debug!(
            "Merged {:?} into {:?} in {} queue",
            absorbed, survivor, self.direction
        );
        rq
    }

    /// Checks that the arena and both indices describe the same set.
    pub fn is_consistent(&self) -> bool {
        if self.sorted.len() != self.entries.len() || self.fifo.len() != self.entries.len() {
            return false;
        }
        let sorted_ok = self.sorted.iter().all(|(key, id)| {
            self.entries
                .get(id)
                .map(|e| e.sort_key() == *key)
                .unwrap_or(false)
        });
        let fifo_ok = self.fifo.iter().all(|(seq, id)| {
            self.entries
                .get(id)
                .map(|e| e.fifo_seq == *seq)
                .unwrap_or(false)
        });
        let cursor_ok = self.next.map(|id| self.contains(id)).unwrap_or(true);
        sorted_ok && fifo_ok && cursor_ok
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn recompute_cursor(&mut self) {
        if self.next.is_none() {
            return;
        }
        if let Some(floor) = self.next_floor {
            self.next = self.first_after(floor);
        }
    }

    fn unhash(&mut self, id: RequestId, end: u64) {
        if let Some(ids) = self.by_end.get_mut(&end) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_end.remove(&end);
            }
        }
    }

    fn rehash(&mut self, id: RequestId, old_end: u64, new_end: u64) {
        let mergeable = self.entries.get(&id).map(|e| e.rq.mergeable).unwrap_or(false);
        if !mergeable {
            return;
        }
        self.unhash(id, old_end);
        self.by_end.entry(new_end).or_default().push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rq(id: u64, sector: u64, nr: u32) -> Request {
        Request::new(RequestId(id), Direction::Read, sector, nr)
    }

    fn queue_with(reqs: &[(u64, u64, u32)]) -> OrderedQueue {
        let mut q = OrderedQueue::new(Direction::Read);
        for (i, (id, sector, nr)) in reqs.iter().enumerate() {
            q.insert(rq(*id, *sector, *nr), 1_000 + i as u64);
        }
        q
    }

    fn sorted_ids(q: &OrderedQueue) -> Vec<u64> {
        q.iter_sorted().map(|r| r.id.0).collect()
    }

    fn fifo_ids(q: &OrderedQueue) -> Vec<u64> {
        q.iter_fifo().map(|r| r.id.0).collect()
    }

    #[test]
    fn test_insert_indexes_both_orders() {
        let q = queue_with(&[(1, 300, 8), (2, 100, 8), (3, 200, 8)]);
        assert_eq!(q.len(), 3);
        assert_eq!(sorted_ids(&q), vec![2, 3, 1]);
        assert_eq!(fifo_ids(&q), vec![1, 2, 3]);
        assert_eq!(q.earliest_by_arrival().unwrap().id, RequestId(1));
        assert_eq!(q.get(RequestId(2)).unwrap().fifo_time_ns(), 1_001);
        assert!(q.is_consistent());
    }

    #[test]
    fn test_equal_sectors_keep_insertion_order() {
        let q = queue_with(&[(1, 100, 8), (2, 100, 8)]);
        assert_eq!(sorted_ids(&q), vec![1, 2]);
        assert_eq!(q.find_front_merge(100), Some(RequestId(1)));
    }

    #[test]
    #[should_panic(expected = "inserted twice")]
    fn test_double_insert_panics() {
        let mut q = queue_with(&[(1, 100, 8)]);
        q.insert(rq(1, 100, 8), 0);
    }

    #[test]
    #[should_panic(expected = "inserted into")]
    fn test_wrong_direction_panics() {
        let mut q = OrderedQueue::new(Direction::Write);
        q.insert(rq(1, 100, 8), 0);
    }

    #[test]
    fn test_successor_and_predecessor() {
        let q = queue_with(&[(1, 300, 8), (2, 100, 8), (3, 200, 8)]);
        assert_eq!(q.successor_by_sector(RequestId(2)).unwrap().id, RequestId(3));
        assert_eq!(q.successor_by_sector(RequestId(3)).unwrap().id, RequestId(1));
        assert!(q.successor_by_sector(RequestId(1)).is_none());
        assert_eq!(q.predecessor_by_sector(RequestId(1)).unwrap().id, RequestId(3));
        assert!(q.predecessor_by_sector(RequestId(2)).is_none());
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let mut q = queue_with(&[(1, 100, 8)]);
        assert!(q.remove(RequestId(99)).is_none());
        assert_eq!(q.len(), 1);
        assert!(q.remove(RequestId(1)).is_some());
        assert!(q.remove(RequestId(1)).is_none());
        assert!(q.is_empty());
        assert!(q.is_consistent());
    }

    #[test]
    fn test_take_for_dispatch_sets_cursor() {
        let mut q = queue_with(&[(1, 100, 8), (2, 200, 8), (3, 300, 8)]);
        let taken = q.take_for_dispatch(RequestId(1));
        assert_eq!(taken.id, RequestId(1));
        assert_eq!(q.next_cursor(), Some(RequestId(2)));
    }

    #[test]
    fn test_removing_cursor_target_advances_cursor() {
        let mut q = queue_with(&[(1, 100, 8), (2, 200, 8), (3, 300, 8)]);
        q.take_for_dispatch(RequestId(1));
        q.remove(RequestId(2));
        assert_eq!(q.next_cursor(), Some(RequestId(3)));
        q.remove(RequestId(3));
        assert_eq!(q.next_cursor(), None);
        assert!(q.is_consistent());
    }

    #[test]
    fn test_back_merge_lookup_and_extend() {
        let mut q = queue_with(&[(1, 100, 10)]);
        assert_eq!(q.find_back_merge(110), Some(RequestId(1)));
        let bio = Bio::new(Direction::Read, 110, 6, false);
        q.extend_back(RequestId(1), &bio);
        assert_eq!(q.get(RequestId(1)).unwrap().end_sector(), 116);
        assert_eq!(q.find_back_merge(110), None);
        assert_eq!(q.find_back_merge(116), Some(RequestId(1)));
    }

    #[test]
    fn test_unmergeable_requests_are_not_hashed() {
        let mut q = OrderedQueue::new(Direction::Read);
        q.insert(rq(1, 100, 10).not_mergeable(), 0);
        assert_eq!(q.find_back_merge(110), None);
    }

    #[test]
    fn test_front_merge_repositions_but_keeps_arrival() {
        let mut q = queue_with(&[(1, 50, 8), (2, 120, 8), (3, 100, 8)]);
        let bio = Bio::new(Direction::Read, 40, 80, false);
        q.reposition_after_front_merge(RequestId(2), &bio);

        let moved = q.get(RequestId(2)).unwrap();
        assert_eq!(moved.sector, 40);
        assert_eq!(moved.end_sector(), 128);
        assert_eq!(moved.fifo_time_ns(), 1_001);
        assert_eq!(sorted_ids(&q), vec![2, 1, 3]);
        assert_eq!(fifo_ids(&q), vec![1, 2, 3]);
        assert!(q.is_consistent());
    }

    #[test]
    fn test_front_merge_ahead_of_cursor_repoints_it() {
        let mut q = queue_with(&[(1, 100, 8), (2, 500, 8), (3, 300, 8)]);
        q.take_for_dispatch(RequestId(1));
        assert_eq!(q.next_cursor(), Some(RequestId(3)));

        let bio = Bio::new(Direction::Read, 200, 300, false);
        q.reposition_after_front_merge(RequestId(2), &bio);
        assert_eq!(q.next_cursor(), Some(RequestId(2)));
    }

    #[test]
    fn test_requests_merged_inherits_earlier_position_and_deadline() {
        let mut q = OrderedQueue::new(Direction::Read);
        q.insert(rq(2, 110, 10), 900);
        q.insert(rq(1, 100, 10), 1_500);

        let absorbed = q.requests_merged(RequestId(1), RequestId(2));
        assert_eq!(absorbed.id, RequestId(2));
        assert_eq!(q.len(), 1);

        let survivor = q.get(RequestId(1)).unwrap();
        assert_eq!(survivor.sector, 100);
        assert_eq!(survivor.end_sector(), 120);
        assert_eq!(survivor.fifo_time_ns(), 900);
        assert_eq!(q.earliest_by_arrival().unwrap().id, RequestId(1));
        assert_eq!(q.find_back_merge(120), Some(RequestId(1)));
        assert!(q.is_consistent());
    }

    #[test]
    fn test_iter_sorted_from() {
        let q = queue_with(&[(1, 300, 8), (2, 100, 8), (3, 200, 8)]);
        let ids: Vec<u64> = q.iter_sorted_from(RequestId(3)).map(|r| r.id.0).collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(q.iter_sorted_from(RequestId(42)).count(), 0);
    }
}
