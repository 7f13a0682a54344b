//! Request, bio and submitter representation consumed by the scheduler.
//!
//! A [`Request`] is created by the block layer, moved into the scheduler at
//! insert time and moved back out at dispatch. The scheduler never holds a
//! request that the caller also holds.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cgroup::CgroupId;

/// Bytes per sector.
pub const SECTOR_SIZE: u64 = 512;

/// Maximum stored length of a thread-group name, excluding the terminator.
pub const TASK_COMM_LEN: usize = 16;

/// Data direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Device to memory.
    Read = 0,
    /// Memory to device.
    Write = 1,
}

impl Direction {
    /// Both directions, read first.
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    /// Returns the index for per-direction arrays (0-1).
    #[inline]
    pub fn as_index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// Stable identity of a request, assigned by the block layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Hardware tag owned by an allocated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag(pub u32);

impl Tag {
    /// Returns the tag as a slot index.
    #[inline]
    pub fn as_index(&self) -> usize {
        self.0 as usize
    }
}

/// Identity of the thread group submitting I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitter {
    /// Thread-group id.
    pub tgid: u32,
    /// Thread-group leader name.
    pub name: String,
    /// Thread-group leader start time in nanoseconds.
    pub start_time_ns: u64,
    /// Cgroup the submitting task belongs to.
    pub cgroup: CgroupId,
}

impl Submitter {
    /// Creates a submitter identity.
    pub fn new(tgid: u32, name: impl Into<String>, start_time_ns: u64, cgroup: CgroupId) -> Self {
        Self {
            tgid,
            name: name.into(),
            start_time_ns,
            cgroup,
        }
    }

    /// Returns the name truncated the way the ledger stores it.
    pub fn stored_name(&self) -> String {
        let mut end = self.name.len().min(TASK_COMM_LEN - 1);
        while !self.name.is_char_boundary(end) {
            end -= 1;
        }
        self.name[..end].to_string()
    }
}

/// A bio: the unit of I/O that may be merged into an existing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bio {
    /// Data direction.
    pub direction: Direction,
    /// First sector.
    pub sector: u64,
    /// Length in sectors.
    pub nr_sectors: u32,
    /// Synchronous (latency sensitive) I/O.
    pub sync: bool,
}

impl Bio {
    /// Creates a bio.
    pub fn new(direction: Direction, sector: u64, nr_sectors: u32, sync: bool) -> Self {
        Self {
            direction,
            sector,
            nr_sectors,
            sync,
        }
    }

    /// Sector one past the end of the bio.
    #[inline]
    pub fn end_sector(&self) -> u64 {
        self.sector + self.nr_sectors as u64
    }

    /// Length in bytes.
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.nr_sectors as u64 * SECTOR_SIZE
    }
}

/// Kind of merge found for a bio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeKind {
    /// Bio appended to the end of a request.
    Back,
    /// Bio prepended to the front of a request; the request's sector changes.
    Front,
}

/// A block I/O request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Unique request identifier.
    pub id: RequestId,
    /// Data direction.
    pub direction: Direction,
    /// First sector.
    pub sector: u64,
    /// Length in sectors.
    pub nr_sectors: u32,
    /// Synchronous (latency sensitive) I/O.
    pub sync: bool,
    /// Passthrough command, never sorted or merged.
    pub passthrough: bool,
    /// Whether the request may take part in merging.
    pub mergeable: bool,
    /// Hardware tag, once allocated.
    pub tag: Option<Tag>,
    pub(crate) fifo_time_ns: u64,
    pub(crate) prepared: bool,
    pub(crate) zone_locked: bool,
    pub(crate) started: bool,
}

impl Request {
    /// Creates a mergeable, asynchronous request without a tag.
    pub fn new(id: RequestId, direction: Direction, sector: u64, nr_sectors: u32) -> Self {
        Self {
            id,
            direction,
            sector,
            nr_sectors,
            sync: false,
            passthrough: false,
            mergeable: true,
            tag: None,
            fifo_time_ns: 0,
            prepared: false,
            zone_locked: false,
            started: false,
        }
    }

    /// Creates a request covering the same range as `bio`.
    pub fn from_bio(id: RequestId, bio: &Bio) -> Self {
        Self::new(id, bio.direction, bio.sector, bio.nr_sectors).with_sync(bio.sync)
    }

    /// Sets the synchronous flag.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Assigns a hardware tag.
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Marks the request as a passthrough command.
    pub fn as_passthrough(mut self) -> Self {
        self.passthrough = true;
        self.mergeable = false;
        self
    }

    /// Excludes the request from merging.
    pub fn not_mergeable(mut self) -> Self {
        self.mergeable = false;
        self
    }

    /// Sector one past the end of the request.
    #[inline]
    pub fn end_sector(&self) -> u64 {
        self.sector + self.nr_sectors as u64
    }

    /// Length in bytes.
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.nr_sectors as u64 * SECTOR_SIZE
    }

    /// Deadline stamped at insert, in clock nanoseconds.
    #[inline]
    pub fn fifo_time_ns(&self) -> u64 {
        self.fifo_time_ns
    }

    /// True for writes that nobody is waiting on synchronously.
    #[inline]
    pub fn is_async_write(&self) -> bool {
        self.direction == Direction::Write && !self.sync
    }

    /// True once the scheduler has prepared (accounted) this request.
    #[inline]
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// True while the request holds its target zone's write lock.
    #[inline]
    pub fn holds_zone_lock(&self) -> bool {
        self.zone_locked
    }

    /// True once the request has been handed to hardware.
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }

    fn merge_flags_match(&self, direction: Direction, sync: bool) -> bool {
        self.mergeable && !self.passthrough && self.direction == direction && self.sync == sync
    }

    /// Whether `bio` may be merged into this request, in either position.
    pub fn can_merge_bio(&self, bio: &Bio, max_sectors: u32) -> bool {
        self.merge_flags_match(bio.direction, bio.sync)
            && self.nr_sectors as u64 + bio.nr_sectors as u64 <= max_sectors as u64
    }

    /// Whether `next`, which must start where this request ends, may be absorbed.
    pub fn can_absorb(&self, next: &Request, max_sectors: u32) -> bool {
        self.end_sector() == next.sector
            && next.mergeable
            && !next.passthrough
            && self.merge_flags_match(next.direction, next.sync)
            && self.nr_sectors as u64 + next.nr_sectors as u64 <= max_sectors as u64
    }
}
