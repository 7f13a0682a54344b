//! Zone write locking for zoned (sequential-write-required) devices.
//!
//! Writes to a sequential zone must reach the device in order, so at most one
//! write per zone may be in flight. A write whose zone is locked is skipped
//! by dispatch, never removed, and becomes eligible again once the in-flight
//! write for that zone finishes.

use std::collections::HashSet;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SchedError, SchedResult};
use crate::request::{Direction, Request};

/// Zone geometry of a zoned device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonedConfig {
    /// Zone size in sectors.
    pub zone_sectors: u64,
    /// Leading zones that accept random writes and need no lock.
    pub conventional_zones: u64,
}

impl ZonedConfig {
    /// Creates a zone geometry.
    pub fn new(zone_sectors: u64, conventional_zones: u64) -> Self {
        Self {
            zone_sectors,
            conventional_zones,
        }
    }

    pub(crate) fn validate(&self) -> SchedResult<()> {
        if self.zone_sectors == 0 {
            return Err(SchedError::InvalidConfig {
                reason: "zone_sectors must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Zone number containing `sector`.
    #[inline]
    pub fn zone_of(&self, sector: u64) -> u64 {
        sector / self.zone_sectors
    }

    /// Whether dispatching `rq` requires its zone's write lock.
    #[inline]
    pub fn needs_write_lock(&self, rq: &Request) -> bool {
        rq.direction == Direction::Write
            && !rq.passthrough
            && self.zone_of(rq.sector) >= self.conventional_zones
    }
}

/// Set of zones with a write in flight. Only reachable through [`ZoneLockTable::lock`].
#[derive(Debug, Default)]
pub struct ZoneLocks {
    locked: HashSet<u64>,
}

impl ZoneLocks {
    /// Whether `rq` may be dispatched now.
    pub fn can_dispatch(&self, geometry: &ZonedConfig, rq: &Request) -> bool {
        if !geometry.needs_write_lock(rq) {
            return true;
        }
        !self.locked.contains(&geometry.zone_of(rq.sector))
    }

    /// Locks the target zone of `rq` if it needs one. Returns false when the
    /// zone was already held by another request; `rq` is then left unmarked.
    pub fn write_lock(&mut self, geometry: &ZonedConfig, rq: &mut Request) -> bool {
        if !geometry.needs_write_lock(rq) || rq.zone_locked {
            return true;
        }
        let zone = geometry.zone_of(rq.sector);
        if !self.locked.insert(zone) {
            warn!("Zone {} already write-locked, dispatching {:?} anyway", zone, rq.id);
            return false;
        }
        rq.zone_locked = true;
        debug!("Zone {} write-locked by {:?}", zone, rq.id);
        true
    }

    /// Releases the zone lock held by `rq`, if any.
    pub fn write_unlock(&mut self, geometry: &ZonedConfig, rq: &mut Request) {
        if !rq.zone_locked {
            return;
        }
        let zone = geometry.zone_of(rq.sector);
        self.locked.remove(&zone);
        rq.zone_locked = false;
        debug!("Zone {} write-unlocked by {:?}", zone, rq.id);
    }

    /// Whether `zone` is currently locked.
    pub fn is_locked(&self, zone: u64) -> bool {
        self.locked.contains(&zone)
    }

    /// Number of locked zones.
    pub fn locked_count(&self) -> usize {
        self.locked.len()
    }
}

/// Zone lock table with its own lock, separate from the queue lock.
#[derive(Debug)]
pub struct ZoneLockTable {
    geometry: ZonedConfig,
    locks: Mutex<ZoneLocks>,
}

impl ZoneLockTable {
    /// Creates an empty table for `geometry`.
    pub fn new(geometry: ZonedConfig) -> Self {
        Self {
            geometry,
            locks: Mutex::new(ZoneLocks::default()),
        }
    }

    /// Zone geometry.
    #[inline]
    pub fn geometry(&self) -> &ZonedConfig {
        &self.geometry
    }

    /// Takes the table lock.
    pub fn lock(&self) -> MutexGuard<'_, ZoneLocks> {
        self.locks.lock()
    }

    /// Whether `zone` is currently locked.
    pub fn is_locked(&self, zone: u64) -> bool {
        self.locks.lock().is_locked(zone)
    }
}
