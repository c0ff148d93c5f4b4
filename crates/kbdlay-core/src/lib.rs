// Kbdlay Core Library
// Scan-code remap engine, device registry and event-chain interception

pub mod chain;
pub mod control;
pub mod device;
pub mod error;
pub mod input;
pub mod registry;
pub mod rules;
pub mod transform;

#[cfg(feature = "settings-file")]
pub mod settings;

pub use chain::{
    ChainAdapter, ConnectData, InputConsumer, InternalRequest, LowerDevice, RelayBuffer,
};
pub use control::{ControlRequest, ControlResponse, ControlSurface, Target};
pub use device::{
    ConnectionState, Counter, CounterSnapshot, DeviceContext, DeviceHandle, DeviceState,
    DeviceStatus, IdentityTag, ModifierShadow, PhysicalModifier, Role,
};
pub use error::{status_of, KbdLayError, KbdLayResult, STATUS_SUCCESS};
pub use input::{KeyFlags, ScanEvent};
pub use registry::{DeviceInfo, DeviceList, DeviceRegistry, IdentityResolver, NoIdentity};
pub use rules::{
    encode_rule_table, parse_rule_blob, validate_rule_blob, RuleBlobBuilder, RuleCell, RuleEntry,
    RuleKey, RuleTable,
};
pub use transform::{EngineConfig, ModifierPolicy, Outcome, RemapEngine, Transformed};

#[cfg(feature = "settings-file")]
pub use settings::{Settings, SettingsError};
