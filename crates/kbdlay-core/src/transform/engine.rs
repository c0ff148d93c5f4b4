// Kbdlay Remap Engine
// Per-event transform: one raw scan event in, zero to three events out
//
// Decision order for each event:
// - hard bypass: untouched, shadow not updated
// - soft bypass, or active on a non-remap device: shadow updated, untouched
// - active remap device: shadow updated, rule table consulted, and a shift
//   toggle synthesised around the mapped key when its desired shift state
//   differs from the physical one

use log::{trace, warn};
use serde::Deserialize;
use smallvec::SmallVec;
use strum_macros::{Display, EnumString};

use crate::device::{Counter, DeviceContext, DeviceState, Role};
use crate::input::{synthetic_shift, KeyFlags, ScanEvent};
use crate::rules::RuleCell;

/// Default number of events the relay buffer holds
pub const DEFAULT_RELAY_CAPACITY: usize = 256;
/// Smallest usable relay buffer (room for one full shift toggle)
pub const MIN_RELAY_CAPACITY: usize = 3;
/// Most events a single input can expand to
pub const MAX_OUTPUT_EVENTS: usize = 3;

/// How an active remap device treats held Ctrl/Alt/Win keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Deserialize)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum ModifierPolicy {
    /// Rules apply regardless of other held modifiers
    #[default]
    Permissive,
    /// Any physical Ctrl/Alt/Win held forces pass-through, so shortcuts
    /// keep their physical key positions
    BypassOnChord,
}

/// Configuration for the remap engine and its relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub modifier_policy: ModifierPolicy,
    /// Relay buffer size in events; raised to `MIN_RELAY_CAPACITY` if lower
    pub relay_capacity: usize,
    /// Role given to newly attached devices
    pub default_role: Role,
    /// State given to newly attached devices
    pub default_state: DeviceState,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            modifier_policy: ModifierPolicy::Permissive,
            relay_capacity: DEFAULT_RELAY_CAPACITY,
            default_role: Role::None,
            default_state: DeviceState::BypassHard,
        }
    }
}

impl EngineConfig {
    /// Relay capacity with the lower bound applied
    pub fn effective_relay_capacity(&self) -> usize {
        self.relay_capacity.max(MIN_RELAY_CAPACITY)
    }
}

/// What the engine did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Forwarded unchanged (bypass, non-remap role, or chord policy)
    PassThrough,
    /// Forwarded unchanged because no rule applied
    Unmapped,
    /// Replaced by the mapped event
    Remapped,
    /// Replaced by shift toggle, mapped event, shift restore
    Toggled,
    /// Needed a shift toggle but had fewer than three slots; mapped event only
    Degraded,
    /// No output slot available; nothing emitted or counted
    NoRoom,
}

/// Output of one transform call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub events: SmallVec<[ScanEvent; MAX_OUTPUT_EVENTS]>,
    pub outcome: Outcome,
}

impl Transformed {
    fn single(event: ScanEvent, outcome: Outcome) -> Self {
        let mut events = SmallVec::new();
        events.push(event);
        Self { events, outcome }
    }

    fn empty() -> Self {
        Self {
            events: SmallVec::new(),
            outcome: Outcome::NoRoom,
        }
    }

    /// True when the event was rewritten
    pub fn remapped(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::Remapped | Outcome::Toggled | Outcome::Degraded
        )
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Apply a rule cell to an input event.
///
/// Only the make code and E0 bit change; BREAK, E1 and opaque bits are kept.
pub fn apply_cell(event: &ScanEvent, cell: RuleCell) -> ScanEvent {
    let mut flags = event.flags;
    flags.set(KeyFlags::E0, cell.wants_e0());
    ScanEvent {
        make_code: cell.out_make_code as u16,
        flags,
        ..*event
    }
}

/// Stateless transform logic; all mutable state lives in the device context
#[derive(Debug, Clone, Default)]
pub struct RemapEngine {
    config: EngineConfig,
}

impl RemapEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Transform one raw event for `ctx`.
    ///
    /// `slots` is the number of output positions the caller can still fill.
    /// Never blocks; the device lock is held only for the shadow update and
    /// table lookup.
    pub fn transform(&self, ctx: &DeviceContext, event: &ScanEvent, slots: usize) -> Transformed {
        if slots == 0 {
            return Transformed::empty();
        }

        let state = ctx.state();
        if state == DeviceState::BypassHard {
            ctx.counters().bump(Counter::PassThroughs);
            return Transformed::single(*event, Outcome::PassThrough);
        }

        if state != DeviceState::Active || ctx.role() != Role::Remap {
            ctx.observe(event);
            ctx.counters().bump(Counter::PassThroughs);
            return Transformed::single(*event, Outcome::PassThrough);
        }

        let seen = ctx.observe_and_lookup(event);

        if self.config.modifier_policy == ModifierPolicy::BypassOnChord
            && seen.modifiers.chord_active()
        {
            ctx.counters().bump(Counter::PassThroughs);
            return Transformed::single(*event, Outcome::PassThrough);
        }

        let cell = match seen.cell {
            Some(cell) if cell.is_mapped() => cell,
            _ => {
                ctx.counters().bump(Counter::Unmapped);
                return Transformed::single(*event, Outcome::Unmapped);
            }
        };

        let mapped = apply_cell(event, cell);
        let physical_shift = seen.modifiers.shift_active();
        let desired_shift = cell.wants_shift();

        if event.is_shift_key() || event.is_e1() || desired_shift == physical_shift {
            ctx.counters().bump(Counter::RemapHits);
            trace!("{}: {} -> {}", ctx.handle(), event, mapped);
            return Transformed::single(mapped, Outcome::Remapped);
        }

        if slots < MAX_OUTPUT_EVENTS {
            ctx.counters().bump(Counter::RemapHits);
            warn!(
                "{}: {} -> {} without shift toggle ({} slots left)",
                ctx.handle(),
                event,
                mapped,
                slots
            );
            return Transformed::single(mapped, Outcome::Degraded);
        }

        let mut events = SmallVec::new();
        events.push(synthetic_shift(event, desired_shift));
        events.push(mapped);
        events.push(synthetic_shift(event, physical_shift));
        ctx.counters().bump(Counter::RemapHits);
        ctx.counters().bump(Counter::ShiftToggles);
        trace!(
            "{}: {} -> {} with shift {}",
            ctx.handle(),
            event,
            mapped,
            if desired_shift { "down" } else { "up" }
        );
        Transformed {
            events,
            outcome: Outcome::Toggled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CounterSnapshot, DeviceHandle};
    use crate::input::{MAKE_ALT, MAKE_CTRL, MAKE_LSHIFT, MAKE_RSHIFT};
    use crate::rules::{RuleBlobBuilder, RuleEntry, RULE_FLAG_E0, RULE_FLAG_SHIFT};
    use std::str::FromStr;

    fn remap_device(entries: &[RuleEntry]) -> DeviceContext {
        let ctx = DeviceContext::new(DeviceHandle(1), Role::Remap, DeviceState::Active);
        let blob = entries
            .iter()
            .fold(RuleBlobBuilder::new(), |b, e| b.entry(*e))
            .build();
        ctx.load_rule_blob(&blob).unwrap();
        ctx
    }

    fn engine() -> RemapEngine {
        RemapEngine::default()
    }

    #[test]
    fn test_hard_bypass_is_identity_and_skips_shadow() {
        let ctx = remap_device(&[RuleEntry::new(0x10, 0, 0x11, 0)]);
        ctx.set_state(DeviceState::BypassHard);

        let out = engine().transform(&ctx, &ScanEvent::make(MAKE_LSHIFT), 3);
        assert_eq!(out.events.as_slice(), &[ScanEvent::make(MAKE_LSHIFT)]);
        assert!(ctx.modifiers().is_empty());

        let out = engine().transform(&ctx, &ScanEvent::make(0x10), 3);
        assert_eq!(out.events.as_slice(), &[ScanEvent::make(0x10)]);
        assert_eq!(ctx.counters().snapshot().pass_throughs, 2);
    }

    #[test]
    fn test_soft_bypass_tracks_modifiers() {
        let ctx = remap_device(&[RuleEntry::new(0x10, 0, 0x11, 0)]);
        ctx.set_state(DeviceState::BypassSoft);

        let out = engine().transform(&ctx, &ScanEvent::make(MAKE_RSHIFT), 3);
        assert_eq!(out.outcome, Outcome::PassThrough);
        assert!(ctx.modifiers().shift_active());

        let out = engine().transform(&ctx, &ScanEvent::make(0x10), 3);
        assert_eq!(out.events.as_slice(), &[ScanEvent::make(0x10)]);
    }

    #[test]
    fn test_active_base_role_passes_through() {
        let ctx = remap_device(&[RuleEntry::new(0x10, 0, 0x11, 0)]);
        ctx.set_role(Role::Base);
        let out = engine().transform(&ctx, &ScanEvent::make(0x10), 3);
        assert_eq!(out.outcome, Outcome::PassThrough);
        assert_eq!(out.events[0].make_code, 0x10);
    }

    #[test]
    fn test_out_of_range_code_is_unmapped() {
        let ctx = remap_device(&[]);
        let out = engine().transform(&ctx, &ScanEvent::make(0x1A0), 3);
        assert_eq!(out.outcome, Outcome::Unmapped);
        assert_eq!(ctx.counters().snapshot().unmapped, 1);
    }

    #[test]
    fn test_zero_output_cell_is_unmapped() {
        let ctx = remap_device(&[RuleEntry::new(0x10, 0, 0x00, RULE_FLAG_SHIFT)]);
        let out = engine().transform(&ctx, &ScanEvent::make(0x10), 3);
        assert_eq!(out.outcome, Outcome::Unmapped);
        assert_eq!(out.events.as_slice(), &[ScanEvent::make(0x10)]);
    }

    #[test]
    fn test_shift_toggle_sequence() {
        let ctx = remap_device(&[RuleEntry::new(0x10, 0, 0x11, RULE_FLAG_SHIFT)]);
        let out = engine().transform(&ctx, &ScanEvent::make(0x10), 3);

        assert_eq!(out.outcome, Outcome::Toggled);
        assert_eq!(
            out.events.as_slice(),
            &[
                ScanEvent::make(MAKE_LSHIFT),
                ScanEvent::make(0x11),
                ScanEvent::brk(MAKE_LSHIFT),
            ]
        );
        let counters = ctx.counters().snapshot();
        assert_eq!(counters.remap_hits, 1);
        assert_eq!(counters.shift_toggles, 1);
    }

    #[test]
    fn test_shift_release_sequence_while_shift_held() {
        // shifted '2' on one layout is '@' which lives unshifted elsewhere
        let ctx = remap_device(&[RuleEntry::new(0x03, RULE_FLAG_SHIFT, 0x1A, 0)]);
        engine().transform(&ctx, &ScanEvent::make(MAKE_LSHIFT), 3);

        let out = engine().transform(&ctx, &ScanEvent::brk(0x03), 3);
        assert_eq!(
            out.events.as_slice(),
            &[
                ScanEvent::brk(MAKE_LSHIFT),
                ScanEvent::brk(0x1A),
                ScanEvent::make(MAKE_LSHIFT),
            ]
        );
    }

    #[test]
    fn test_matching_shift_emits_mapped_only() {
        let ctx = remap_device(&[RuleEntry::new(0x03, RULE_FLAG_SHIFT, 0x28, RULE_FLAG_SHIFT)]);
        engine().transform(&ctx, &ScanEvent::make(MAKE_LSHIFT), 3);
        let out = engine().transform(&ctx, &ScanEvent::make(0x03), 3);
        assert_eq!(out.outcome, Outcome::Remapped);
        assert_eq!(out.events.as_slice(), &[ScanEvent::make(0x28)]);
    }

    #[test]
    fn test_mapped_event_keeps_break_and_takes_cell_e0() {
        let ctx = remap_device(&[RuleEntry::new(0x47, RULE_FLAG_E0, 0x49, 0)]);
        let mut input = ScanEvent::brk(0x47).with_e0().with_unit(2);
        input.extra_information = 0xABCD;
        input.flags = input.flags | KeyFlags(0x40);

        let out = engine().transform(&ctx, &input, 3);
        let mapped = out.events[0];
        assert_eq!(mapped.make_code, 0x49);
        assert!(mapped.is_break());
        assert!(!mapped.is_e0());
        assert!(mapped.flags.contains(KeyFlags(0x40)));
        assert_eq!(mapped.unit_id, 2);
        assert_eq!(mapped.extra_information, 0xABCD);
    }

    #[test]
    fn test_shift_key_input_never_toggles() {
        let ctx = remap_device(&[RuleEntry::new(0x2A, 0, 0x36, RULE_FLAG_SHIFT)]);
        let out = engine().transform(&ctx, &ScanEvent::brk(MAKE_LSHIFT), 3);
        assert_eq!(out.outcome, Outcome::Remapped);
        assert_eq!(out.events.len(), 1);
    }

    #[test]
    fn test_e1_input_never_toggles() {
        let ctx = remap_device(&[RuleEntry::new(0x1D, 0, 0x45, RULE_FLAG_SHIFT)]);
        let out = engine().transform(&ctx, &ScanEvent::make(0x1D).with_e1(), 3);
        assert_eq!(out.outcome, Outcome::Remapped);
        assert!(out.events[0].is_e1());
    }

    #[test]
    fn test_degrades_without_room_for_toggle() {
        let ctx = remap_device(&[RuleEntry::new(0x10, 0, 0x11, RULE_FLAG_SHIFT)]);
        let out = engine().transform(&ctx, &ScanEvent::make(0x10), 2);
        assert_eq!(out.outcome, Outcome::Degraded);
        assert_eq!(out.events.as_slice(), &[ScanEvent::make(0x11)]);
        let counters = ctx.counters().snapshot();
        assert_eq!(counters.remap_hits, 1);
        assert_eq!(counters.shift_toggles, 0);
    }

    #[test]
    fn test_zero_slots_emits_nothing() {
        let ctx = remap_device(&[]);
        let out = engine().transform(&ctx, &ScanEvent::make(0x10), 0);
        assert!(out.is_empty());
        assert_eq!(ctx.counters().snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_bypass_on_chord_policy() {
        let config = EngineConfig {
            modifier_policy: ModifierPolicy::BypassOnChord,
            ..EngineConfig::default()
        };
        let engine = RemapEngine::new(config);
        let ctx = remap_device(&[RuleEntry::new(0x10, 0, 0x11, 0)]);

        engine.transform(&ctx, &ScanEvent::make(MAKE_CTRL), 3);
        let out = engine.transform(&ctx, &ScanEvent::make(0x10), 3);
        assert_eq!(out.outcome, Outcome::PassThrough);

        engine.transform(&ctx, &ScanEvent::brk(MAKE_CTRL), 3);
        let out = engine.transform(&ctx, &ScanEvent::make(0x10), 3);
        assert_eq!(out.outcome, Outcome::Remapped);
    }

    #[test]
    fn test_permissive_policy_ignores_chord() {
        let ctx = remap_device(&[RuleEntry::new(0x10, 0, 0x11, 0)]);
        engine().transform(&ctx, &ScanEvent::make(MAKE_ALT).with_e0(), 3);
        let out = engine().transform(&ctx, &ScanEvent::make(0x10), 3);
        assert_eq!(out.outcome, Outcome::Remapped);
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(
            ModifierPolicy::from_str("bypass-on-chord"),
            Ok(ModifierPolicy::BypassOnChord)
        );
        assert_eq!(ModifierPolicy::Permissive.to_string(), "permissive");
    }

    #[test]
    fn test_relay_capacity_floor() {
        let config = EngineConfig {
            relay_capacity: 1,
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_relay_capacity(), MIN_RELAY_CAPACITY);
        assert_eq!(EngineConfig::default().effective_relay_capacity(), 256);
    }
}
