//! Per-cgroup request throttling.
//!
//! Each cgroup carries a policy (`max_available_ratio`, the percentage of the
//! tag depth it may hold). Each (cgroup, device) pair carries an instance
//! with a live in-flight counter and the limits derived from the policy and
//! the device's tag geometry. Once the in-flight count reaches
//! `max_available_requests`, allocations from that cgroup are limited to the
//! instance's shallow depth.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MAX_RATIO;
use crate::error::{SchedError, SchedResult};
use crate::tags::TagGeometry;

/// Handle of a cgroup in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CgroupId(pub u64);

impl CgroupId {
    /// The root cgroup, present in every registry.
    pub const ROOT: CgroupId = CgroupId(1);
}

impl fmt::Display for CgroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cgroup:{}", self.0)
    }
}

/// Handle of a block device queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{}", self.0)
    }
}

/// Policy attached to one cgroup, shared by all its device instances.
#[derive(Debug)]
pub struct CgroupThrottlePolicy {
    cgroup: CgroupId,
    parent: Option<CgroupId>,
    // Stands in for the cgroup's own lock: held while the ratio changes and
    // the instances are recomputed.
    max_available_ratio: RwLock<u32>,
}

impl CgroupThrottlePolicy {
    fn new(cgroup: CgroupId, parent: Option<CgroupId>) -> Self {
        Self {
            cgroup,
            parent,
            max_available_ratio: RwLock::new(MAX_RATIO),
        }
    }

    /// Cgroup this policy belongs to.
    pub fn cgroup(&self) -> CgroupId {
        self.cgroup
    }

    /// Parent cgroup; `None` for the root.
    pub fn parent(&self) -> Option<CgroupId> {
        self.parent
    }

    /// Configured percentage of the tag depth.
    pub fn max_available_ratio(&self) -> u32 {
        *self.max_available_ratio.read()
    }
}

/// Limits derived from a ratio and a tag geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleLimits {
    /// In-flight requests the cgroup may hold before it is throttled.
    pub max_available_requests: u32,
    /// Per-word allocation depth applied while throttled.
    pub shallow_depth: u32,
}

impl ThrottleLimits {
    /// Derives limits for `ratio` percent of `geometry`.
    pub fn compute(ratio: u32, geometry: &TagGeometry) -> Self {
        Self::compute_raw(ratio, geometry.depth, geometry.map_nr())
    }

    /// `max_available = depth * ratio / 100`, `shallow = max(1, max_available / map_nr)`.
    pub fn compute_raw(ratio: u32, depth: u32, map_nr: u32) -> Self {
        let ratio = ratio.min(MAX_RATIO);
        let max_available_requests = (depth as u64 * ratio as u64 / MAX_RATIO as u64) as u32;
        let shallow_depth = (max_available_requests / map_nr.max(1)).max(1);
        Self {
            max_available_requests,
            shallow_depth,
        }
    }
}

/// Live state of one (cgroup, device) pair.
#[derive(Debug)]
pub struct CgroupThrottleInstance {
    cgroup: CgroupId,
    device: DeviceId,
    current_in_flight: AtomicU32,
    limits: RwLock<ThrottleLimits>,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupThrottleStat {
    /// Cgroup of the instance.
    pub cgroup: CgroupId,
    /// Device of the instance.
    pub device: DeviceId,
    /// Configured ratio.
    pub max_available_ratio: u32,
    /// Derived in-flight limit.
    pub max_available_requests: u32,
    /// Derived shallow depth.
    pub shallow_depth: u32,
    /// Requests currently counted in flight.
    pub current_in_flight: u32,
}

impl CgroupThrottleInstance {
    fn new(cgroup: CgroupId, device: DeviceId, limits: ThrottleLimits) -> Self {
        Self {
            cgroup,
            device,
            current_in_flight: AtomicU32::new(0),
            limits: RwLock::new(limits),
        }
    }

    /// Cgroup of this instance.
    pub fn cgroup(&self) -> CgroupId {
        self.cgroup
    }

    /// Device of this instance.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Requests currently counted in flight.
    pub fn in_flight(&self) -> u32 {
        self.current_in_flight.load(Ordering::Relaxed)
    }

    /// Current derived limits.
    pub fn limits(&self) -> ThrottleLimits {
        *self.limits.read()
    }

    /// Shallow depth to apply to the next allocation, or `None` while the
    /// cgroup is below its in-flight limit.
    pub fn throttle_depth(&self) -> Option<u32> {
        let limits = self.limits();
        if self.in_flight() < limits.max_available_requests {
            return None;
        }
        Some(limits.shallow_depth)
    }

    fn recompute(&self, ratio: u32, geometry: &TagGeometry) {
        *self.limits.write() = ThrottleLimits::compute(ratio, geometry);
    }

    fn reset_in_flight(&self) {
        self.current_in_flight.store(0, Ordering::Relaxed);
    }
}

/// Policies, instances and the cgroup tree.
#[derive(Debug)]
pub struct CgroupThrottleRegistry {
    policies: DashMap<CgroupId, Arc<CgroupThrottlePolicy>>,
    instances: DashMap<(CgroupId, DeviceId), Arc<CgroupThrottleInstance>>,
    devices: DashMap<DeviceId, TagGeometry>,
}

impl Default for CgroupThrottleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupThrottleRegistry {
    /// Creates a registry containing only the root cgroup.
    pub fn new() -> Self {
        let policies = DashMap::new();
        policies.insert(
            CgroupId::ROOT,
            Arc::new(CgroupThrottlePolicy::new(CgroupId::ROOT, None)),
        );
        Self {
            policies,
            instances: DashMap::new(),
            devices: DashMap::new(),
        }
    }

    /// Adds `cgroup` under `parent` with the default ratio and attaches it
    /// to every registered device. Re-creating an existing cgroup is a no-op.
    pub fn create_cgroup(&self, cgroup: CgroupId, parent: CgroupId) -> SchedResult<()> {
        if !self.policies.contains_key(&parent) {
            return Err(SchedError::UnknownCgroup { cgroup: parent });
        }
        if self.policies.contains_key(&cgroup) {
            return Ok(());
        }
        self.policies.insert(
            cgroup,
            Arc::new(CgroupThrottlePolicy::new(cgroup, Some(parent))),
        );
        let devices: Vec<(DeviceId, TagGeometry)> =
            self.devices.iter().map(|e| (*e.key(), *e.value())).collect();
        for (device, geometry) in devices {
            self.attach_with(cgroup, device, MAX_RATIO, &geometry);
        }
        debug!("Created {} under {}", cgroup, parent);
        Ok(())
    }

    /// Removes a leaf cgroup and its instances. Outstanding handles stay
    /// valid; counting through them no longer affects admission.
    pub fn remove_cgroup(&self, cgroup: CgroupId) -> SchedResult<()> {
        if cgroup == CgroupId::ROOT {
            return Err(SchedError::InvalidConfig {
                reason: "the root cgroup cannot be removed".to_string(),
            });
        }
        if !self.policies.contains_key(&cgroup) {
            return Err(SchedError::UnknownCgroup { cgroup });
        }
        if self.children(cgroup).next().is_some() {
            return Err(SchedError::InvalidConfig {
                reason: format!("{} still has children", cgroup),
            });
        }
        self.instances.retain(|(cg, _), _| *cg != cgroup);
        self.policies.remove(&cgroup);
        debug!("Removed {}", cgroup);
        Ok(())
    }

    /// Whether `cgroup` exists.
    pub fn contains(&self, cgroup: CgroupId) -> bool {
        self.policies.contains_key(&cgroup)
    }

    /// Policy of `cgroup`.
    pub fn policy(&self, cgroup: CgroupId) -> Option<Arc<CgroupThrottlePolicy>> {
        self.policies.get(&cgroup).map(|p| Arc::clone(p.value()))
    }

    fn children(&self, cgroup: CgroupId) -> impl Iterator<Item = CgroupId> {
        let mut kids: Vec<CgroupId> = self
            .policies
            .iter()
            .filter(|p| p.parent() == Some(cgroup))
            .map(|p| *p.key())
            .collect();
        kids.sort();
        kids.into_iter()
    }

    /// Visits `root` and every descendant, parents before children.
    pub fn for_each_descendant(&self, root: CgroupId, mut f: impl FnMut(CgroupId)) {
        if !self.contains(root) {
            return;
        }
        let mut stack = vec![root];
        while let Some(cgroup) = stack.pop() {
            f(cgroup);
            let mut kids: Vec<CgroupId> = self.children(cgroup).collect();
            kids.reverse();
            stack.extend(kids);
        }
    }

    /// Registers a device queue and attaches every cgroup to it.
    pub fn register_device(&self, device: DeviceId, geometry: TagGeometry) {
        self.devices.insert(device, geometry);
        let mut cgroups = Vec::new();
        self.for_each_descendant(CgroupId::ROOT, |cg| cgroups.push(cg));
        for cgroup in cgroups {
            let ratio = self
                .policy(cgroup)
                .map(|p| p.max_available_ratio())
                .unwrap_or(MAX_RATIO);
            self.attach_with(cgroup, device, ratio, &geometry);
        }
        info!(
            "Registered {} with depth={}, map_nr={}",
            device,
            geometry.depth,
            geometry.map_nr()
        );
    }

    /// Drops every instance of `device`.
    pub fn detach_device(&self, device: DeviceId) {
        self.instances.retain(|(_, dev), _| *dev != device);
        self.devices.remove(&device);
        info!("Detached {}", device);
    }

    /// Creates (or returns) the instance for `cgroup` on `device`.
    pub fn attach(
        &self,
        cgroup: CgroupId,
        device: DeviceId,
    ) -> Option<Arc<CgroupThrottleInstance>> {
        let geometry = *self.devices.get(&device)?;
        let ratio = self.policy(cgroup)?.max_available_ratio();
        Some(self.attach_with(cgroup, device, ratio, &geometry))
    }

    fn attach_with(
        &self,
        cgroup: CgroupId,
        device: DeviceId,
        ratio: u32,
        geometry: &TagGeometry,
    ) -> Arc<CgroupThrottleInstance> {
        let entry = self.instances.entry((cgroup, device)).or_insert_with(|| {
            Arc::new(CgroupThrottleInstance::new(
                cgroup,
                device,
                ThrottleLimits::compute(ratio, geometry),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Instance for `cgroup` on `device`.
    pub fn lookup(
        &self,
        cgroup: CgroupId,
        device: DeviceId,
    ) -> Option<Arc<CgroupThrottleInstance>> {
        self.instances
            .get(&(cgroup, device))
            .map(|i| Arc::clone(i.value()))
    }

    /// Configured ratio of `cgroup`.
    pub fn max_available_ratio(&self, cgroup: CgroupId) -> SchedResult<u32> {
        self.policy(cgroup)
            .map(|p| p.max_available_ratio())
            .ok_or(SchedError::UnknownCgroup { cgroup })
    }

    /// Sets the ratio of `cgroup`, clamped to `0..=100`, and recomputes every
    /// live instance of it from its device's current geometry. Returns the
    /// stored value.
    pub fn on_policy_change(&self, cgroup: CgroupId, new_ratio: i64) -> SchedResult<u32> {
        let policy = self
            .policy(cgroup)
            .ok_or(SchedError::UnknownCgroup { cgroup })?;
        let ratio = new_ratio.clamp(0, MAX_RATIO as i64) as u32;
        if ratio as i64 != new_ratio {
            warn!(
                "Clamping max_available_ratio for {} from {} to {}",
                cgroup, new_ratio, ratio
            );
        }

        let mut guard = policy.max_available_ratio.write();
        *guard = ratio;
        for entry in self.instances.iter() {
            let (cg, device) = *entry.key();
            if cg != cgroup {
                continue;
            }
            if let Some(geometry) = self.devices.get(&device) {
                entry.value().recompute(ratio, &geometry);
            }
        }
        drop(guard);

        debug!("Set max_available_ratio={} for {}", ratio, cgroup);
        Ok(ratio)
    }

    /// Records a new tag geometry for `device` and recomputes every instance
    /// on it, resetting in-flight counts to zero.
    pub fn on_hardware_depth_change(&self, device: DeviceId, geometry: TagGeometry) {
        self.devices.insert(device, geometry);
        let mut cgroups = Vec::new();
        self.for_each_descendant(CgroupId::ROOT, |cg| cgroups.push(cg));
        for cgroup in cgroups {
            let Some(policy) = self.policy(cgroup) else {
                continue;
            };
            let Some(instance) = self.lookup(cgroup, device) else {
                continue;
            };
            let ratio = policy.max_available_ratio.read();
            instance.recompute(*ratio, &geometry);
            instance.reset_in_flight();
        }
        debug!(
            "Depth change on {}: depth={}, map_nr={}",
            device,
            geometry.depth,
            geometry.map_nr()
        );
    }

    /// Counts a request against `instance`. Absent handles are ignored.
    pub fn inc(instance: Option<&Arc<CgroupThrottleInstance>>) {
        if let Some(instance) = instance {
            instance.current_in_flight.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Releases a request from `instance`. Absent handles are ignored and the
    /// count never drops below zero (a depth change may have reset it).
    pub fn dec(instance: Option<&Arc<CgroupThrottleInstance>>) {
        if let Some(instance) = instance {
            let _ = instance.current_in_flight.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |v| v.checked_sub(1),
            );
        }
    }

    /// Shallow depth for an allocation by `cgroup` on `device`, or `None`
    /// when unthrottled or unknown.
    pub fn shallow_depth(&self, cgroup: CgroupId, device: DeviceId) -> Option<u32> {
        self.lookup(cgroup, device)?.throttle_depth()
    }

    /// Snapshot of the instance for `cgroup` on `device`.
    pub fn stat(&self, cgroup: CgroupId, device: DeviceId) -> Option<CgroupThrottleStat> {
        let instance = self.lookup(cgroup, device)?;
        Some(self.stat_of(&instance))
    }

    fn stat_of(&self, instance: &CgroupThrottleInstance) -> CgroupThrottleStat {
        let limits = instance.limits();
        CgroupThrottleStat {
            cgroup: instance.cgroup,
            device: instance.device,
            max_available_ratio: self
                .policy(instance.cgroup)
                .map(|p| p.max_available_ratio())
                .unwrap_or(MAX_RATIO),
            max_available_requests: limits.max_available_requests,
            shallow_depth: limits.shallow_depth,
            current_in_flight: instance.in_flight(),
        }
    }

    /// Snapshot of every instance on `device`, ordered by cgroup.
    pub fn device_stats(&self, device: DeviceId) -> Vec<CgroupThrottleStat> {
        let instances: Vec<Arc<CgroupThrottleInstance>> = self
            .instances
            .iter()
            .filter(|e| e.key().1 == device)
            .map(|e| e.value().clone())
            .collect();
        let mut out: Vec<CgroupThrottleStat> =
            instances.iter().map(|i| self.stat_of(i)).collect();
        out.sort_by_key(|s| s.cgroup);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: DeviceId = DeviceId(0);

    fn registry_with_device(depth: u32) -> CgroupThrottleRegistry {
        let registry = CgroupThrottleRegistry::new();
        registry.register_device(DEV, TagGeometry::for_depth(depth));
        registry
    }

    #[test]
    fn test_limits_compute() {
        let limits = ThrottleLimits::compute(50, &TagGeometry::for_depth(32));
        assert_eq!(limits.max_available_requests, 16);
        assert_eq!(limits.shallow_depth, 4);

        let limits = ThrottleLimits::compute(0, &TagGeometry::for_depth(32));
        assert_eq!(limits.max_available_requests, 0);
        assert_eq!(limits.shallow_depth, 1);

        let limits = ThrottleLimits::compute(250, &TagGeometry::for_depth(32));
        assert_eq!(limits.max_available_requests, 32);
    }

    #[test]
    fn test_root_exists_and_attaches() {
        let registry = registry_with_device(32);
        assert!(registry.contains(CgroupId::ROOT));
        let root = registry.lookup(CgroupId::ROOT, DEV).unwrap();
        assert_eq!(root.limits().max_available_requests, 32);
        assert_eq!(root.throttle_depth(), None);
    }

    #[test]
    fn test_create_cgroup_requires_parent() {
        let registry = registry_with_device(32);
        let result = registry.create_cgroup(CgroupId(5), CgroupId(4));
        assert!(matches!(result, Err(SchedError::UnknownCgroup { .. })));

        registry.create_cgroup(CgroupId(4), CgroupId::ROOT).unwrap();
        registry.create_cgroup(CgroupId(5), CgroupId(4)).unwrap();
        assert!(registry.lookup(CgroupId(5), DEV).is_some());
    }

    #[test]
    fn test_policy_change_clamps_and_recomputes() {
        let registry = registry_with_device(32);
        registry.create_cgroup(CgroupId(2), CgroupId::ROOT).unwrap();

        assert_eq!(registry.on_policy_change(CgroupId(2), 50).unwrap(), 50);
        let instance = registry.lookup(CgroupId(2), DEV).unwrap();
        assert_eq!(instance.limits().max_available_requests, 16);

        assert_eq!(registry.on_policy_change(CgroupId(2), 400).unwrap(), 100);
        assert_eq!(instance.limits().max_available_requests, 32);

        assert_eq!(registry.on_policy_change(CgroupId(2), -3).unwrap(), 0);
        assert_eq!(instance.limits().max_available_requests, 0);
        assert_eq!(registry.max_available_ratio(CgroupId(2)).unwrap(), 0);
    }

    #[test]
    fn test_policy_change_unknown_cgroup() {
        let registry = registry_with_device(32);
        assert!(registry.on_policy_change(CgroupId(9), 10).is_err());
    }

    #[test]
    fn test_throttle_after_limit_reached() {
        let registry = registry_with_device(32);
        registry.create_cgroup(CgroupId(2), CgroupId::ROOT).unwrap();
        registry.on_policy_change(CgroupId(2), 50).unwrap();
        let instance = registry.lookup(CgroupId(2), DEV).unwrap();

        for _ in 0..15 {
            CgroupThrottleRegistry::inc(Some(&instance));
        }
        assert_eq!(registry.shallow_depth(CgroupId(2), DEV), None);
        CgroupThrottleRegistry::inc(Some(&instance));
        assert_eq!(registry.shallow_depth(CgroupId(2), DEV), Some(4));

        CgroupThrottleRegistry::dec(Some(&instance));
        assert_eq!(registry.shallow_depth(CgroupId(2), DEV), None);
    }

    #[test]
    fn test_inc_dec_absent_handle_is_noop() {
        CgroupThrottleRegistry::inc(None);
        CgroupThrottleRegistry::dec(None);
    }

    #[test]
    fn test_dec_saturates_at_zero() {
        let registry = registry_with_device(32);
        let root = registry.lookup(CgroupId::ROOT, DEV).unwrap();
        CgroupThrottleRegistry::dec(Some(&root));
        assert_eq!(root.in_flight(), 0);
    }

    #[test]
    fn test_depth_change_recomputes_and_resets() {
        let registry = registry_with_device(32);
        registry.create_cgroup(CgroupId(2), CgroupId::ROOT).unwrap();
        registry.on_policy_change(CgroupId(2), 50).unwrap();
        let instance = registry.lookup(CgroupId(2), DEV).unwrap();
        for _ in 0..10 {
            CgroupThrottleRegistry::inc(Some(&instance));
        }

        registry.on_hardware_depth_change(DEV, TagGeometry::for_depth(256));
        assert_eq!(instance.in_flight(), 0);
        assert_eq!(instance.limits().max_available_requests, 128);
        assert_eq!(instance.limits().shallow_depth, 32);
    }

    #[test]
    fn test_for_each_descendant_preorder() {
        let registry = CgroupThrottleRegistry::new();
        registry.create_cgroup(CgroupId(2), CgroupId::ROOT).unwrap();
        registry.create_cgroup(CgroupId(3), CgroupId::ROOT).unwrap();
        registry.create_cgroup(CgroupId(4), CgroupId(2)).unwrap();

        let mut seen = Vec::new();
        registry.for_each_descendant(CgroupId::ROOT, |cg| seen.push(cg.0));
        assert_eq!(seen, vec![1, 2, 4, 3]);

        let mut sub = Vec::new();
        registry.for_each_descendant(CgroupId(2), |cg| sub.push(cg.0));
        assert_eq!(sub, vec![2, 4]);
    }

    #[test]
    fn test_remove_cgroup_rules() {
        let registry = registry_with_device(32);
        registry.create_cgroup(CgroupId(2), CgroupId::ROOT).unwrap();
        registry.create_cgroup(CgroupId(3), CgroupId(2)).unwrap();

        assert!(registry.remove_cgroup(CgroupId::ROOT).is_err());
        assert!(registry.remove_cgroup(CgroupId(2)).is_err());

        let handle = registry.lookup(CgroupId(3), DEV).unwrap();
        registry.remove_cgroup(CgroupId(3)).unwrap();
        assert!(registry.lookup(CgroupId(3), DEV).is_none());
        CgroupThrottleRegistry::dec(Some(&handle));

        registry.remove_cgroup(CgroupId(2)).unwrap();
        assert!(!registry.contains(CgroupId(2)));
    }

    #[test]
    fn test_register_device_attaches_existing_cgroups() {
        let registry = CgroupThrottleRegistry::new();
        registry.create_cgroup(CgroupId(2), CgroupId::ROOT).unwrap();
        registry.on_policy_change(CgroupId(2), 25).unwrap();
        registry.register_device(DeviceId(1), TagGeometry::for_depth(64));

        let instance = registry.lookup(CgroupId(2), DeviceId(1)).unwrap();
        assert_eq!(instance.limits().max_available_requests, 16);
    }

    #[test]
    fn test_detach_device_and_stats() {
        let registry = registry_with_device(32);
        registry.create_cgroup(CgroupId(2), CgroupId::ROOT).unwrap();
        let stats = registry.device_stats(DEV);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].cgroup, CgroupId::ROOT);
        assert_eq!(stats[1].max_available_ratio, 100);

        registry.on_policy_change(CgroupId(2), 50).unwrap();
        CgroupThrottleRegistry::inc(registry.lookup(CgroupId(2), DEV).as_ref());
        let stat = registry.stat(CgroupId(2), DEV).unwrap();
        assert_eq!(stat.max_available_ratio, 50);
        assert_eq!(stat.max_available_requests, 16);
        assert_eq!(stat.shallow_depth, 4);
        assert_eq!(stat.current_in_flight, 1);
        assert!(registry.stat(CgroupId(9), DEV).is_none());

        registry.detach_device(DEV);
        assert!(registry.device_stats(DEV).is_empty());
        assert!(registry.attach(CgroupId(2), DEV).is_none());
    }
}
