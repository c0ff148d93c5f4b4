// Kbdlay Device Context
// Per-instance role, state, rules, modifier shadow, counters and upstream hookup

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chain::InputConsumer;
use crate::device::identity::{DeviceHandle, IdentityTag};
use crate::device::modifiers::ModifierShadow;
use crate::device::role::{DeviceState, Role};
use crate::error::{status_of, KbdLayError, KbdLayResult, STATUS_SUCCESS};
use crate::input::ScanEvent;
use crate::rules::{parse_rule_blob, RuleCell, RuleKey, RuleTable};

/// Which counter an event contributes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    RemapHits,
    PassThroughs,
    Unmapped,
    ShiftToggles,
}

/// Monotonic event counters, updated without the device lock
#[derive(Debug, Default)]
pub struct Counters {
    remap_hits: AtomicU64,
    pass_throughs: AtomicU64,
    unmapped: AtomicU64,
    shift_toggles: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn bump(&self, counter: Counter) {
        let cell = match counter {
            Counter::RemapHits => &self.remap_hits,
            Counter::PassThroughs => &self.pass_throughs,
            Counter::Unmapped => &self.unmapped,
            Counter::ShiftToggles => &self.shift_toggles,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all four counters; not a transactional snapshot
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            remap_hits: self.remap_hits.load(Ordering::Relaxed),
            pass_throughs: self.pass_throughs.load(Ordering::Relaxed),
            unmapped: self.unmapped.load(Ordering::Relaxed),
            shift_toggles: self.shift_toggles.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a device's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub remap_hits: u64,
    pub pass_throughs: u64,
    pub unmapped: u64,
    pub shift_toggles: u64,
}

impl CounterSnapshot {
    /// Sum with another snapshot (used when merging a tag group)
    pub fn merged(self, other: CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            remap_hits: self.remap_hits.saturating_add(other.remap_hits),
            pass_throughs: self.pass_throughs.saturating_add(other.pass_throughs),
            unmapped: self.unmapped.saturating_add(other.unmapped),
            shift_toggles: self.shift_toggles.saturating_add(other.shift_toggles),
        }
    }

    /// Total number of input events accounted for
    pub fn events(&self) -> u64 {
        self.remap_hits + self.pass_throughs + self.unmapped
    }
}

/// Status report for one device or a merged tag group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    pub role: Role,
    pub state: DeviceState,
    pub counters: CounterSnapshot,
    pub last_error: u32,
    pub tag: Option<IdentityTag>,
}

/// Where a device is in the connect/disconnect protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Captured original consumer and the protocol state around it
#[derive(Default)]
pub(crate) struct UpstreamConnection {
    state: ConnectionState,
    consumer: Option<Arc<dyn InputConsumer>>,
    generation: u64,
}

impl UpstreamConnection {
    fn clear(&mut self) {
        self.consumer = None;
        self.state = ConnectionState::Disconnected;
    }
}

/// Live consumer captured for one delivery batch
#[derive(Clone)]
pub(crate) struct UpstreamSnapshot {
    pub consumer: Arc<dyn InputConsumer>,
    pub generation: u64,
}

struct DeviceInner {
    rules: Arc<RuleTable>,
    modifiers: ModifierShadow,
    tag: Option<IdentityTag>,
    upstream: UpstreamConnection,
}

/// Result of observing one event under the device lock
#[derive(Debug, Clone, Copy)]
pub(crate) struct Observation {
    pub modifiers: ModifierShadow,
    pub cell: Option<RuleCell>,
}

/// State of one logical keyboard device instance.
///
/// Role, state and last error are plain atomics; counters are atomics
/// bumped outside any lock. The rule table, modifier shadow, identity tag
/// and upstream connection share one short-held mutex that is never held
/// across a call into another layer.
pub struct DeviceContext {
    handle: DeviceHandle,
    role: AtomicU32,
    state: AtomicU32,
    last_error: AtomicU32,
    counters: Counters,
    inner: Mutex<DeviceInner>,
}

impl DeviceContext {
    /// Create an unregistered context
    pub fn new(handle: DeviceHandle, role: Role, state: DeviceState) -> Self {
        Self {
            handle,
            role: AtomicU32::new(role.raw()),
            state: AtomicU32::new(state.raw()),
            last_error: AtomicU32::new(STATUS_SUCCESS),
            counters: Counters::default(),
            inner: Mutex::new(DeviceInner {
                rules: Arc::new(RuleTable::empty()),
                modifiers: ModifierShadow::default(),
                tag: None,
                upstream: UpstreamConnection::default(),
            }),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn role(&self) -> Role {
        Role::from_repr(self.role.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role.raw(), Ordering::Release);
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_state(&self, state: DeviceState) {
        self.state.store(state.raw(), Ordering::Release);
    }

    /// Last recorded status code (0 = success)
    pub fn last_error(&self) -> u32 {
        self.last_error.load(Ordering::Acquire)
    }

    pub fn set_last_error(&self, code: u32) {
        self.last_error.store(code, Ordering::Release);
    }

    /// Record the outcome of an operation as LastErrorCode
    pub fn record<T>(&self, result: &KbdLayResult<T>) {
        self.set_last_error(status_of(result));
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Identity tag, if resolved
    pub fn tag(&self) -> Option<IdentityTag> {
        self.inner.lock().tag
    }

    /// Store a resolved tag.
    ///
    /// The null tag is ignored, so a known tag never reverts to unknown.
    /// Returns the previous tag when the stored value changed.
    pub(crate) fn store_tag(&self, tag: IdentityTag) -> Option<Option<IdentityTag>> {
        let tag = tag.non_null()?;
        let mut inner = self.inner.lock();
        if inner.tag == Some(tag) {
            return None;
        }
        Some(inner.tag.replace(tag))
    }

    /// Current rule table
    pub fn rules(&self) -> Arc<RuleTable> {
        Arc::clone(&self.inner.lock().rules)
    }

    /// Validate and install a rule blob.
    ///
    /// The table is built before the lock is taken; on rejection the live
    /// table is untouched.
    pub fn load_rule_blob(&self, blob: &[u8]) -> KbdLayResult<()> {
        let table = Arc::new(parse_rule_blob(blob)?);
        self.replace_rules(table);
        Ok(())
    }

    /// Swap in an already-built table
    pub fn replace_rules(&self, table: Arc<RuleTable>) {
        let previous = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.rules, table)
        };
        // the old table is released outside the lock
        drop(previous);
    }

    /// Current physical modifier shadow
    pub fn modifiers(&self) -> ModifierShadow {
        self.inner.lock().modifiers
    }

    /// Feed a raw event to the modifier shadow
    pub(crate) fn observe(&self, event: &ScanEvent) -> ModifierShadow {
        let mut inner = self.inner.lock();
        inner.modifiers.observe(event);
        inner.modifiers
    }

    /// Feed a raw event to the shadow, then look up its rule cell with the
    /// resulting shift state, all in one critical section
    pub(crate) fn observe_and_lookup(&self, event: &ScanEvent) -> Observation {
        let mut inner = self.inner.lock();
        inner.modifiers.observe(event);
        let modifiers = inner.modifiers;
        let cell = if event.is_indexable() {
            let key = RuleKey::new(
                event.is_e0(),
                modifiers.shift_active(),
                event.make_code as u8,
            );
            inner.rules.lookup(key)
        } else {
            None
        };
        Observation { modifiers, cell }
    }

    /// Snapshot of role, state, counters, last error and tag
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            role: self.role(),
            state: self.state(),
            counters: self.counters.snapshot(),
            last_error: self.last_error(),
            tag: self.tag(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().upstream.state
    }

    /// Capture the original consumer and enter Connecting.
    ///
    /// Fails with a sharing violation unless the device is Disconnected.
    pub(crate) fn begin_connect(&self, consumer: Arc<dyn InputConsumer>) -> KbdLayResult<u64> {
        let mut inner = self.inner.lock();
        let upstream = &mut inner.upstream;
        if upstream.state != ConnectionState::Disconnected {
            return Err(KbdLayError::SharingViolation);
        }
        upstream.generation = upstream.generation.wrapping_add(1);
        upstream.consumer = Some(consumer);
        upstream.state = ConnectionState::Connecting;
        Ok(upstream.generation)
    }

    /// Resolve a pending connect: commit on success, roll back on failure
    pub(crate) fn finish_connect(&self, generation: u64, succeeded: bool) {
        let mut inner = self.inner.lock();
        let upstream = &mut inner.upstream;
        if upstream.generation != generation || upstream.state != ConnectionState::Connecting {
            return;
        }
        if succeeded {
            upstream.state = ConnectionState::Connected;
        } else {
            upstream.clear();
        }
    }

    /// Enter Disconnecting; returns false when nothing is connected
    pub(crate) fn begin_disconnect(&self) -> bool {
        let mut inner = self.inner.lock();
        let upstream = &mut inner.upstream;
        match upstream.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                upstream.state = ConnectionState::Disconnecting;
                true
            }
            _ => false,
        }
    }

    /// Drop the captured consumer and return to Disconnected
    pub(crate) fn clear_upstream(&self) {
        self.inner.lock().upstream.clear();
    }

    /// Consumer to relay to, if one is captured and live
    pub(crate) fn upstream(&self) -> Option<UpstreamSnapshot> {
        let inner = self.inner.lock();
        let upstream = &inner.upstream;
        match upstream.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                upstream.consumer.as_ref().map(|consumer| UpstreamSnapshot {
                    consumer: Arc::clone(consumer),
                    generation: upstream.generation,
                })
            }
            _ => None,
        }
    }

    /// Check that the connection captured as `generation` is still live
    pub(crate) fn upstream_is_live(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        let upstream = &inner.upstream;
        upstream.generation == generation
            && upstream.consumer.is_some()
            && matches!(
                upstream.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("handle", &self.handle)
            .field("role", &self.role())
            .field("state", &self.state())
            .field("last_error", &self.last_error())
            .finish_non_exhaustive()
    }
}
