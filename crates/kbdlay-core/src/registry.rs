// Kbdlay Device Registry
// Live device set with identity-tag addressing and refresh-and-retry lookup

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::device::{
    CounterSnapshot, DeviceContext, DeviceHandle, DeviceState, DeviceStatus, IdentityTag, Role,
};
use crate::error::{KbdLayError, KbdLayResult};
use crate::transform::EngineConfig;

/// Devices sharing one identity tag; almost always one or two
pub type TagGroup = SmallVec<[Arc<DeviceContext>; 2]>;

/// Out-of-band lookup of a device's identity tag.
///
/// Best effort: `None` leaves the device's current tag in place.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, handle: DeviceHandle) -> Option<IdentityTag>;
}

/// Resolver for stacks with no identity source
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentity;

impl IdentityResolver for NoIdentity {
    fn resolve(&self, _handle: DeviceHandle) -> Option<IdentityTag> {
        None
    }
}

/// One entry of a device enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub handle: DeviceHandle,
    /// Null when unknown
    pub tag: IdentityTag,
    pub has_tag: bool,
}

/// Device enumeration result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceList {
    /// Number of live devices
    pub total: usize,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Default)]
struct Members {
    devices: IndexMap<DeviceHandle, Arc<DeviceContext>>,
    by_tag: IndexMap<IdentityTag, SmallVec<[DeviceHandle; 2]>>,
    // registry-side copy of each device's tag, so reads never need a device lock
    tags: IndexMap<DeviceHandle, IdentityTag>,
}

impl Members {
    fn index_tag(&mut self, handle: DeviceHandle, tag: IdentityTag) {
        if let Some(previous) = self.tags.insert(handle, tag) {
            self.unindex(handle, previous);
        }
        let group = self.by_tag.entry(tag).or_default();
        if !group.contains(&handle) {
            group.push(handle);
        }
    }

    fn unindex(&mut self, handle: DeviceHandle, tag: IdentityTag) {
        if let Some(group) = self.by_tag.get_mut(&tag) {
            group.retain(|h| *h != handle);
            if group.is_empty() {
                self.by_tag.shift_remove(&tag);
            }
        }
    }

    /// Drop a device and its tag entry
    fn remove(&mut self, handle: DeviceHandle) -> Option<Arc<DeviceContext>> {
        let ctx = self.devices.shift_remove(&handle)?;
        if let Some(tag) = self.tags.shift_remove(&handle) {
            self.unindex(handle, tag);
        }
        Some(ctx)
    }

    fn tag_of(&self, handle: &DeviceHandle) -> Option<IdentityTag> {
        self.tags.get(handle).copied()
    }

    /// Devices with `tag`, in registration order
    fn group(&self, tag: IdentityTag) -> TagGroup {
        let mut group: TagGroup = self
            .by_tag
            .get(&tag)
            .into_iter()
            .flatten()
            .filter_map(|handle| self.devices.get(handle).cloned())
            .collect();
        group.sort_by_key(|ctx| self.devices.get_index_of(&ctx.handle()));
        group
    }
}

/// Process-wide collection of live devices.
///
/// One lock guards membership and the tag index. It is held only while the
/// collections are read or changed and never across a resolver call. The
/// only device lock taken under it is the tag store in `refresh_device`,
/// always registry first; no device path takes the registry lock.
pub struct DeviceRegistry {
    members: RwLock<Members>,
    resolver: Arc<dyn IdentityResolver>,
    config: EngineConfig,
    next_handle: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(config: EngineConfig, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            members: RwLock::new(Members::default()),
            resolver,
            config,
            next_handle: AtomicU64::new(1),
        }
    }

    /// Registry without an identity source
    pub fn without_identity(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(NoIdentity))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a new device instance and try to resolve its tag once
    pub fn attach(&self) -> Arc<DeviceContext> {
        let handle = DeviceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let ctx = Arc::new(DeviceContext::new(
            handle,
            self.config.default_role,
            self.config.default_state,
        ));
        self.members
            .write()
            .devices
            .insert(handle, Arc::clone(&ctx));
        debug!("{}: attached", handle);
        self.refresh_device(&ctx);
        ctx
    }

    /// Second identity lookup once the device stack is running
    pub fn device_started(&self, handle: DeviceHandle) -> KbdLayResult<()> {
        let ctx = self.device(handle)?;
        self.refresh_device(&ctx);
        Ok(())
    }

    /// Remove a device instance
    pub fn detach(&self, handle: DeviceHandle) -> Option<Arc<DeviceContext>> {
        let ctx = self.members.write().remove(handle)?;
        debug!("{}: detached", handle);
        Some(ctx)
    }

    /// Device by handle
    pub fn device(&self, handle: DeviceHandle) -> KbdLayResult<Arc<DeviceContext>> {
        self.members
            .read()
            .devices
            .get(&handle)
            .cloned()
            .ok_or(KbdLayError::NotFound)
    }

    /// Snapshot of the live devices in registration order
    pub fn devices(&self) -> Vec<Arc<DeviceContext>> {
        self.members.read().devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().devices.is_empty()
    }

    fn refresh_device(&self, ctx: &DeviceContext) {
        let handle = ctx.handle();
        let Some(tag) = self.resolver.resolve(handle) else {
            debug!("{}: identity tag not available", handle);
            return;
        };

        // store and index in one critical section so concurrent refreshes
        // cannot leave the index disagreeing with the device
        let mut members = self.members.write();
        if !members.devices.contains_key(&handle) {
            // detached while the resolver ran
            return;
        }
        if ctx.store_tag(tag).is_some() {
            members.index_tag(handle, tag);
            debug!("{}: identity tag {}", handle, tag);
        }
    }

    /// Re-resolve the identity tag of every live device
    pub fn refresh_all(&self) {
        for ctx in self.devices() {
            self.refresh_device(&ctx);
        }
    }

    /// Devices currently carrying `tag`, without refreshing
    pub fn find_by_tag(&self, tag: IdentityTag) -> TagGroup {
        if tag.is_null() {
            return TagGroup::new();
        }
        self.members.read().group(tag)
    }

    /// Look `tag` up; on a miss refresh every device's tag and look once more
    pub fn lookup_or_refresh(&self, tag: IdentityTag) -> KbdLayResult<TagGroup> {
        let first = self.find_by_tag(tag);
        if !first.is_empty() {
            return Ok(first);
        }

        debug!("{}: no match, refreshing identity tags", tag);
        self.refresh_all();

        let second = self.find_by_tag(tag);
        if second.is_empty() {
            warn!("{}: no device with this identity tag", tag);
            return Err(KbdLayError::NotFound);
        }
        Ok(second)
    }

    /// Run `op` on every device carrying `tag`.
    ///
    /// Each device's LastErrorCode records its own outcome. Failures do not
    /// stop the broadcast: devices that succeeded keep the change and the
    /// last failure is returned. On success returns the number of devices.
    pub fn apply_by_tag<F>(&self, tag: IdentityTag, op: F) -> KbdLayResult<usize>
    where
        F: Fn(&DeviceContext) -> KbdLayResult<()>,
    {
        let group = self.lookup_or_refresh(tag)?;
        let mut last_error = None;
        for ctx in &group {
            let result = op(ctx);
            ctx.record(&result);
            if let Err(err) = result {
                warn!("{}: {} rejected: {}", tag, ctx.handle(), err);
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(group.len()),
        }
    }

    /// Set the role of every device carrying `tag`
    pub fn set_role(&self, tag: IdentityTag, role: Role) -> KbdLayResult<usize> {
        let applied = self.apply_by_tag(tag, |ctx| {
            ctx.set_role(role);
            Ok(())
        })?;
        debug!("{}: role {} on {} device(s)", tag, role, applied);
        Ok(applied)
    }

    /// Set the state of every device carrying `tag`
    pub fn set_state(&self, tag: IdentityTag, state: DeviceState) -> KbdLayResult<usize> {
        let applied = self.apply_by_tag(tag, |ctx| {
            ctx.set_state(state);
            Ok(())
        })?;
        debug!("{}: state {} on {} device(s)", tag, state, applied);
        Ok(applied)
    }

    /// Load a rule blob on every device carrying `tag`.
    ///
    /// Not atomic across the group: devices that accept the blob keep it
    /// even when another device rejects it, and the call then reports the
    /// last rejection.
    pub fn set_rule_blob(&self, tag: IdentityTag, blob: &[u8]) -> KbdLayResult<usize> {
        let applied = self.apply_by_tag(tag, |ctx| ctx.load_rule_blob(blob))?;
        debug!("{}: {}-byte rule blob on {} device(s)", tag, blob.len(), applied);
        Ok(applied)
    }

    /// Merged status of every device carrying `tag`.
    ///
    /// Counters are summed. Role, state, last error and tag are taken from
    /// the most recently registered match, i.e. the last device of the
    /// group in registration order, not the first.
    pub fn get_status(&self, tag: IdentityTag) -> KbdLayResult<DeviceStatus> {
        let group = self.lookup_or_refresh(tag)?;
        let mut merged = DeviceStatus::default();
        let mut counters = CounterSnapshot::default();
        for ctx in &group {
            let status = ctx.status();
            counters = counters.merged(status.counters);
            merged = status;
        }
        merged.counters = counters;
        Ok(merged)
    }

    /// Distinct known tags in first-seen order.
    ///
    /// Fails with `BufferTooSmall` for zero capacity and `BufferOverflow`
    /// when there are more tags than `capacity`.
    pub fn enumerate_tags(&self, capacity: usize) -> KbdLayResult<Vec<IdentityTag>> {
        if capacity == 0 {
            return Err(KbdLayError::BufferTooSmall);
        }
        let members = self.members.read();
        let mut tags: Vec<IdentityTag> = Vec::with_capacity(capacity.min(members.by_tag.len()));
        for handle in members.devices.keys() {
            let Some(tag) = members.tag_of(handle) else {
                continue;
            };
            if tags.contains(&tag) {
                continue;
            }
            if tags.len() >= capacity {
                return Err(KbdLayError::BufferOverflow);
            }
            tags.push(tag);
        }
        Ok(tags)
    }

    /// Every live device with its tag.
    ///
    /// Same capacity rules as [`DeviceRegistry::enumerate_tags`].
    pub fn enumerate_devices(&self, capacity: usize) -> KbdLayResult<DeviceList> {
        if capacity == 0 {
            return Err(KbdLayError::BufferTooSmall);
        }
        let members = self.members.read();
        let total = members.devices.len();
        if total > capacity {
            return Err(KbdLayError::BufferOverflow);
        }
        let devices = members
            .devices
            .keys()
            .map(|handle| {
                let tag = members.tag_of(handle);
                DeviceInfo {
                    handle: *handle,
                    tag: tag.unwrap_or(IdentityTag::NULL),
                    has_tag: tag.is_some(),
                }
            })
            .collect();
        Ok(DeviceList { total, devices })
    }
}
