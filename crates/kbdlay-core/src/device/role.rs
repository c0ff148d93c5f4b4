// Kbdlay Device Role and State
// Configured intent and runtime activation level of a device instance

use serde::Deserialize;
use strum_macros::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};

use crate::error::{KbdLayError, KbdLayResult};

/// Configured intent for a device instance.
///
/// The numeric values are the ones carried on the control wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, EnumIter, FromRepr,
    IntoStaticStr, Deserialize,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum Role {
    /// Unconfigured
    #[default]
    None = 0,
    /// Unmodified side: always pass-through
    Base = 1,
    /// Remapped side: the engine applies rules when Active
    Remap = 2,
}

impl Role {
    /// Decode a wire value, rejecting anything out of range
    pub fn from_raw(raw: u32) -> KbdLayResult<Self> {
        Self::from_repr(raw).ok_or(KbdLayError::InvalidParameter)
    }

    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// Runtime activation level of a device instance
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, EnumIter, FromRepr,
    IntoStaticStr, Deserialize,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum DeviceState {
    /// Engine untouched, no modifier tracking
    #[default]
    BypassHard = 0,
    /// Pass-through, modifier shadow still updated
    BypassSoft = 1,
    /// Engine fully applied (only with `Role::Remap`)
    Active = 2,
}

impl DeviceState {
    /// Decode a wire value, rejecting anything out of range
    pub fn from_raw(raw: u32) -> KbdLayResult<Self> {
        Self::from_repr(raw).ok_or(KbdLayError::InvalidParameter)
    }

    pub fn raw(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_role_raw_values() {
        assert_eq!(Role::from_raw(0), Ok(Role::None));
        assert_eq!(Role::from_raw(1), Ok(Role::Base));
        assert_eq!(Role::from_raw(2), Ok(Role::Remap));
        assert_eq!(Role::from_raw(3), Err(KbdLayError::InvalidParameter));
    }

    #[test]
    fn test_state_raw_values() {
        assert_eq!(DeviceState::from_raw(0), Ok(DeviceState::BypassHard));
        assert_eq!(DeviceState::from_raw(2), Ok(DeviceState::Active));
        assert_eq!(
            DeviceState::from_raw(u32::MAX),
            Err(KbdLayError::InvalidParameter)
        );
    }

    #[test]
    fn test_names_round_trip() {
        for role in Role::iter() {
            assert_eq!(Role::from_str(&role.to_string()), Ok(role));
        }
        for state in DeviceState::iter() {
            assert_eq!(DeviceState::from_str(&state.to_string()), Ok(state));
        }
        assert_eq!(DeviceState::BypassSoft.to_string(), "bypass-soft");
        assert_eq!(Role::from_str("REMAP"), Ok(Role::Remap));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Role::default(), Role::None);
        assert_eq!(DeviceState::default(), DeviceState::BypassHard);
    }
}
