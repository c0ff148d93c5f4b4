// Kbdlay Relay Buffer
// Bounded, order-preserving staging of engine output before delivery upstream

use crate::input::ScanEvent;
use crate::transform::MIN_RELAY_CAPACITY;

/// Fixed-capacity buffer of events waiting to be handed to the consumer.
///
/// The backing storage is allocated once; pushing never grows it.
#[derive(Debug, Clone)]
pub struct RelayBuffer {
    events: Vec<ScanEvent>,
    capacity: usize,
}

impl RelayBuffer {
    /// Create a buffer holding at most `capacity` events (never below 3)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_RELAY_CAPACITY);
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Free slots left
    pub fn remaining(&self) -> usize {
        self.capacity - self.events.len()
    }

    /// Check if `count` more events would not fit
    pub fn would_overflow(&self, count: usize) -> bool {
        count > self.remaining()
    }

    /// Append events in order; returns false (and appends nothing) if they
    /// do not all fit
    pub fn push_all(&mut self, events: &[ScanEvent]) -> bool {
        if self.would_overflow(events.len()) {
            return false;
        }
        self.events.extend_from_slice(events);
        true
    }

    pub fn as_slice(&self) -> &[ScanEvent] {
        &self.events
    }

    /// Drop buffered events, keeping the allocation
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Default for RelayBuffer {
    fn default() -> Self {
        Self::with_capacity(crate::transform::DEFAULT_RELAY_CAPACITY)
    }
}

impl AsRef<[ScanEvent]> for RelayBuffer {
    fn as_ref(&self) -> &[ScanEvent] {
        &self.events
    }
}
