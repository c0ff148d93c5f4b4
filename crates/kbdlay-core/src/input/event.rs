// Kbdlay Input Layer - Scan Events
// Raw keyboard scan-code events as delivered by the port driver

use std::fmt;

/// Set-1 make code for left shift
pub const MAKE_LSHIFT: u16 = 0x2A;
/// Set-1 make code for right shift
pub const MAKE_RSHIFT: u16 = 0x36;
/// Set-1 make code for ctrl (E0 prefix selects the right key)
pub const MAKE_CTRL: u16 = 0x1D;
/// Set-1 make code for alt (E0 prefix selects right alt / AltGr)
pub const MAKE_ALT: u16 = 0x38;
/// Set-1 make code for the left Windows key
pub const MAKE_LWIN: u16 = 0x5B;
/// Set-1 make code for the right Windows key
pub const MAKE_RWIN: u16 = 0x5C;

/// Largest make code that can index a rule table
pub const MAX_INDEXABLE_CODE: u16 = 0xFF;

/// Scan event flag bits.
///
/// Bits other than the named ones are opaque to the engine and carried
/// through unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct KeyFlags(pub u16);

impl KeyFlags {
    /// Key-down (absence of BREAK)
    pub const MAKE: KeyFlags = KeyFlags(0x00);
    /// Key-up
    pub const BREAK: KeyFlags = KeyFlags(0x01);
    /// E0 extended prefix
    pub const E0: KeyFlags = KeyFlags(0x02);
    /// E1 extended prefix
    pub const E1: KeyFlags = KeyFlags(0x04);

    /// Raw bit value
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Check whether all bits of `other` are set
    pub fn contains(self, other: KeyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set or clear the bits of `other`
    pub fn set(&mut self, other: KeyFlags, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    /// Copy with the bits of `other` cleared
    pub fn without(self, other: KeyFlags) -> KeyFlags {
        KeyFlags(self.0 & !other.0)
    }
}

impl std::ops::BitOr for KeyFlags {
    type Output = KeyFlags;

    fn bitor(self, rhs: KeyFlags) -> KeyFlags {
        KeyFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for KeyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        parts.push(if self.contains(KeyFlags::BREAK) { "BREAK" } else { "MAKE" });
        if self.contains(KeyFlags::E0) {
            parts.push("E0");
        }
        if self.contains(KeyFlags::E1) {
            parts.push("E1");
        }
        let extra = self.0 & !(KeyFlags::BREAK.0 | KeyFlags::E0.0 | KeyFlags::E1.0);
        if extra != 0 {
            write!(f, "{}|{:#06x}", parts.join("|"), extra)
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

/// One keyboard input record.
///
/// The engine treats caller-owned events as immutable values; every derived
/// event (remapped key, synthetic shift) is a fresh copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScanEvent {
    /// Keyboard unit the event came from
    pub unit_id: u16,
    /// Scan code; only 0..=0xFF can be remapped
    pub make_code: u16,
    /// Make/break and prefix flags
    pub flags: KeyFlags,
    /// Opaque device-specific payload
    pub extra_information: u32,
}

impl ScanEvent {
    /// Key-down event for `make_code`
    pub fn make(make_code: u16) -> Self {
        Self {
            make_code,
            ..Self::default()
        }
    }

    /// Key-up event for `make_code`
    pub fn brk(make_code: u16) -> Self {
        Self {
            make_code,
            flags: KeyFlags::BREAK,
            ..Self::default()
        }
    }

    /// Add the E0 prefix
    pub fn with_e0(mut self) -> Self {
        self.flags.set(KeyFlags::E0, true);
        self
    }

    /// Add the E1 prefix
    pub fn with_e1(mut self) -> Self {
        self.flags.set(KeyFlags::E1, true);
        self
    }

    /// Set the unit id
    pub fn with_unit(mut self, unit_id: u16) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn is_break(&self) -> bool {
        self.flags.contains(KeyFlags::BREAK)
    }

    pub fn is_e0(&self) -> bool {
        self.flags.contains(KeyFlags::E0)
    }

    pub fn is_e1(&self) -> bool {
        self.flags.contains(KeyFlags::E1)
    }

    /// True when the make code can index a rule table
    pub fn is_indexable(&self) -> bool {
        self.make_code <= MAX_INDEXABLE_CODE
    }

    /// True for the left or right shift make codes
    pub fn is_shift_key(&self) -> bool {
        is_shift_make_code(self.make_code)
    }
}

impl fmt::Display for ScanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_e1() {
            "e1 "
        } else if self.is_e0() {
            "e0 "
        } else {
            ""
        };
        let polarity = if self.is_break() { "break" } else { "make" };
        write!(f, "{}{:02x} {}", prefix, self.make_code, polarity)
    }
}

/// Check if a make code is one of the two shift keys
pub fn is_shift_make_code(make_code: u16) -> bool {
    make_code == MAKE_LSHIFT || make_code == MAKE_RSHIFT
}

/// Build a synthetic left-shift event derived from `reference`.
///
/// The unit id and extra information follow the reference event; both
/// extended prefixes are cleared and BREAK reflects `down`.
pub fn synthetic_shift(reference: &ScanEvent, down: bool) -> ScanEvent {
    let mut flags = reference.flags.without(KeyFlags::E0 | KeyFlags::E1);
    flags.set(KeyFlags::BREAK, !down);
    ScanEvent {
        unit_id: reference.unit_id,
        make_code: MAKE_LSHIFT,
        flags,
        extra_information: reference.extra_information,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_and_break_constructors() {
        let down = ScanEvent::make(0x1E);
        assert!(!down.is_break());
        assert_eq!(down.flags, KeyFlags::MAKE);

        let up = ScanEvent::brk(0x1E);
        assert!(up.is_break());
        assert!(!up.is_e0());
    }

    #[test]
    fn test_prefix_flags() {
        let ev = ScanEvent::make(0x1D).with_e0();
        assert!(ev.is_e0());
        assert!(!ev.is_e1());

        let pause = ScanEvent::make(0x1D).with_e1();
        assert!(pause.is_e1());
    }

    #[test]
    fn test_indexable_range() {
        assert!(ScanEvent::make(0xFF).is_indexable());
        assert!(!ScanEvent::make(0x100).is_indexable());
    }

    #[test]
    fn test_synthetic_shift_clears_prefixes() {
        let reference = ScanEvent::brk(0x48).with_e0().with_unit(3);
        let down = synthetic_shift(&reference, true);
        assert_eq!(down.make_code, MAKE_LSHIFT);
        assert!(!down.is_break());
        assert!(!down.is_e0());
        assert!(!down.is_e1());
        assert_eq!(down.unit_id, 3);

        let up = synthetic_shift(&reference, false);
        assert!(up.is_break());
        assert!(!up.is_e0());
    }

    #[test]
    fn test_synthetic_shift_keeps_opaque_bits() {
        let mut reference = ScanEvent::make(0x10);
        reference.flags = KeyFlags(0x08) | KeyFlags::E0;
        let down = synthetic_shift(&reference, true);
        assert_eq!(down.flags, KeyFlags(0x08));
    }

    #[test]
    fn test_shift_make_codes() {
        assert!(is_shift_make_code(0x2A));
        assert!(is_shift_make_code(0x36));
        assert!(!is_shift_make_code(0x1D));
    }

    #[test]
    fn test_display() {
        assert_eq!(ScanEvent::make(0x1E).to_string(), "1e make");
        assert_eq!(ScanEvent::brk(0x1D).with_e0().to_string(), "e0 1d break");
    }
}
