// Kbdlay Device Model
// Per-instance context plus the identifiers used to address it

mod context;
mod identity;
mod modifiers;
mod role;

pub(crate) use context::{Observation, UpstreamSnapshot};
pub use context::{
    ConnectionState, Counter, CounterSnapshot, Counters, DeviceContext, DeviceStatus,
};
pub use identity::{DeviceHandle, IdentityTag, IdentityTagParseError};
pub use modifiers::{ModifierShadow, PhysicalModifier};
pub use role::{DeviceState, Role};
