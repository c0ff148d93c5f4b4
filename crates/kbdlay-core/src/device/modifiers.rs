// Kbdlay Physical Modifier Shadow
// Left/right modifier state derived from raw hardware make/break events

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::input::{ScanEvent, MAKE_ALT, MAKE_CTRL, MAKE_LSHIFT, MAKE_LWIN, MAKE_RSHIFT, MAKE_RWIN};

/// One physical modifier key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum PhysicalModifier {
    LeftShift,
    RightShift,
    LeftCtrl,
    RightCtrl,
    LeftAlt,
    RightAlt,
    LeftWin,
    RightWin,
}

impl PhysicalModifier {
    #[inline]
    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Identify the modifier a raw event refers to.
    ///
    /// Shift is only recognised without E0: E0-prefixed shift codes are fake
    /// shifts some keyboards wrap around navigation keys.
    pub fn classify(event: &ScanEvent) -> Option<Self> {
        let e0 = event.is_e0();
        match event.make_code {
            MAKE_LSHIFT if !e0 => Some(PhysicalModifier::LeftShift),
            MAKE_RSHIFT if !e0 => Some(PhysicalModifier::RightShift),
            MAKE_CTRL if e0 => Some(PhysicalModifier::RightCtrl),
            MAKE_CTRL => Some(PhysicalModifier::LeftCtrl),
            MAKE_ALT if e0 => Some(PhysicalModifier::RightAlt),
            MAKE_ALT => Some(PhysicalModifier::LeftAlt),
            MAKE_LWIN => Some(PhysicalModifier::LeftWin),
            MAKE_RWIN => Some(PhysicalModifier::RightWin),
            _ => None,
        }
    }
}

const SHIFT_MASK: u8 = 0b0000_0011;
const CHORD_MASK: u8 = 0b1111_1100;

/// Shadow of the physically held modifiers.
///
/// Only raw input feeds this state, never rule output, so remapped or
/// synthetic shift events cannot confuse it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModifierShadow {
    pressed: u8,
}

impl ModifierShadow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update from a raw event; returns false for non-modifier codes
    pub fn observe(&mut self, event: &ScanEvent) -> bool {
        match PhysicalModifier::classify(event) {
            Some(modifier) => {
                if event.is_break() {
                    self.pressed &= !modifier.bit();
                } else {
                    self.pressed |= modifier.bit();
                }
                true
            }
            None => false,
        }
    }

    pub fn is_down(&self, modifier: PhysicalModifier) -> bool {
        self.pressed & modifier.bit() != 0
    }

    /// Either shift key held
    pub fn shift_active(&self) -> bool {
        self.pressed & SHIFT_MASK != 0
    }

    /// Any ctrl, alt or Windows key held
    pub fn chord_active(&self) -> bool {
        self.pressed & CHORD_MASK != 0
    }

    /// Iterate the held modifiers
    pub fn pressed(&self) -> impl Iterator<Item = PhysicalModifier> + '_ {
        PhysicalModifier::iter().filter(move |m| self.is_down(*m))
    }

    pub fn is_empty(&self) -> bool {
        self.pressed == 0
    }
}
