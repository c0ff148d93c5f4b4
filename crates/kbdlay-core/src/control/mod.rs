// Kbdlay Control Surface
// Configuration requests addressed to one device or to an identity tag

pub mod wire;

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::device::{DeviceContext, DeviceHandle, DeviceState, DeviceStatus, IdentityTag, Role};
use crate::error::KbdLayResult;
use crate::registry::{DeviceList, DeviceRegistry};

/// What a request applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// A single device instance
    Device(DeviceHandle),
    /// Every device of one physical keyboard
    Tag(IdentityTag),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Device(handle) => write!(f, "{}", handle),
            Target::Tag(tag) => write!(f, "{}", tag),
        }
    }
}

/// A configuration request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    SetRole { target: Target, role: Role },
    SetState { target: Target, state: DeviceState },
    /// Tag targets may partially apply; see [`DeviceRegistry::set_rule_blob`]
    SetRuleBlob { target: Target, blob: Vec<u8> },
    GetStatus { target: Target },
    EnumerateTags { capacity: usize },
    EnumerateDevices { capacity: usize },
}

/// Reply to a successful request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// A set operation reached this many devices
    Applied { devices: usize },
    Status(DeviceStatus),
    Tags(Vec<IdentityTag>),
    Devices(DeviceList),
}

/// Dispatches control requests against a registry
#[derive(Clone)]
pub struct ControlSurface {
    registry: Arc<DeviceRegistry>,
}

impl ControlSurface {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn on_device<F>(&self, handle: DeviceHandle, op: F) -> KbdLayResult<ControlResponse>
    where
        F: FnOnce(&DeviceContext) -> KbdLayResult<()>,
    {
        let ctx = self.registry.device(handle)?;
        let result = op(&ctx);
        ctx.record(&result);
        result.map(|()| ControlResponse::Applied { devices: 1 })
    }

    /// Execute one request
    pub fn dispatch(&self, request: ControlRequest) -> KbdLayResult<ControlResponse> {
        match request {
            ControlRequest::SetRole { target, role } => {
                debug!("set role {} on {}", role, target);
                match target {
                    Target::Device(handle) => self.on_device(handle, |ctx| {
                        ctx.set_role(role);
                        Ok(())
                    }),
                    Target::Tag(tag) => self
                        .registry
                        .set_role(tag, role)
                        .map(|devices| ControlResponse::Applied { devices }),
                }
            }
            ControlRequest::SetState { target, state } => {
                debug!("set state {} on {}", state, target);
                match target {
                    Target::Device(handle) => self.on_device(handle, |ctx| {
                        ctx.set_state(state);
                        Ok(())
                    }),
                    Target::Tag(tag) => self
                        .registry
                        .set_state(tag, state)
                        .map(|devices| ControlResponse::Applied { devices }),
                }
            }
            ControlRequest::SetRuleBlob { target, blob } => match target {
                Target::Device(handle) => self.on_device(handle, |ctx| ctx.load_rule_blob(&blob)),
                Target::Tag(tag) => self
                    .registry
                    .set_rule_blob(tag, &blob)
                    .map(|devices| ControlResponse::Applied { devices }),
            },
            ControlRequest::GetStatus { target } => match target {
                Target::Device(handle) => {
                    Ok(ControlResponse::Status(self.registry.device(handle)?.status()))
                }
                Target::Tag(tag) => self.registry.get_status(tag).map(ControlResponse::Status),
            },
            ControlRequest::EnumerateTags { capacity } => self
                .registry
                .enumerate_tags(capacity)
                .map(ControlResponse::Tags),
            ControlRequest::EnumerateDevices { capacity } => self
                .registry
                .enumerate_devices(capacity)
                .map(ControlResponse::Devices),
        }
    }

    /// Decode, execute and encode one wire request.
    ///
    /// `device` is the implicit target of the per-device control codes.
    pub fn handle_control(
        &self,
        code: u32,
        input: &[u8],
        output_len: usize,
        device: Option<DeviceHandle>,
    ) -> KbdLayResult<Vec<u8>> {
        let request = wire::decode_request(code, input, output_len, device)?;
        let response = self.dispatch(request)?;
        Ok(wire::encode_response(&response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KbdLayError, STATUS_SUCCESS};
    use crate::registry::IdentityResolver;
    use crate::rules::{RuleBlobBuilder, RuleEntry};
    use crate::transform::EngineConfig;

    struct FixedTag(IdentityTag);

    impl IdentityResolver for FixedTag {
        fn resolve(&self, _handle: DeviceHandle) -> Option<IdentityTag> {
            Some(self.0)
        }
    }

    fn tag() -> IdentityTag {
        IdentityTag::from_bytes([3; 16])
    }

    fn surface() -> ControlSurface {
        let registry = DeviceRegistry::new(EngineConfig::default(), Arc::new(FixedTag(tag())));
        ControlSurface::new(Arc::new(registry))
    }

    #[test]
    fn test_device_target_role_and_state() {
        let surface = surface();
        let ctx = surface.registry().attach();
        let target = Target::Device(ctx.handle());

        surface
            .dispatch(ControlRequest::SetRole {
                target,
                role: Role::Remap,
            })
            .unwrap();
        surface
            .dispatch(ControlRequest::SetState {
                target,
                state: DeviceState::Active,
            })
            .unwrap();

        match surface.dispatch(ControlRequest::GetStatus { target }).unwrap() {
            ControlResponse::Status(status) => {
                assert_eq!(status.role, Role::Remap);
                assert_eq!(status.state, DeviceState::Active);
                assert_eq!(status.tag, Some(tag()));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_unknown_device_is_not_found() {
        let surface = surface();
        assert_eq!(
            surface.dispatch(ControlRequest::GetStatus {
                target: Target::Device(DeviceHandle(42))
            }),
            Err(KbdLayError::NotFound)
        );
    }

    #[test]
    fn test_device_blob_rejection_recorded() {
        let surface = surface();
        let ctx = surface.registry().attach();
        let result = surface.dispatch(ControlRequest::SetRuleBlob {
            target: Target::Device(ctx.handle()),
            blob: vec![0; 20],
        });
        assert_eq!(result, Err(KbdLayError::InvalidParameter));
        assert_eq!(ctx.last_error(), KbdLayError::InvalidParameter.code());

        let blob = RuleBlobBuilder::new()
            .entry(RuleEntry::new(0x10, 0, 0x11, 0))
            .build();
        surface
            .dispatch(ControlRequest::SetRuleBlob {
                target: Target::Device(ctx.handle()),
                blob,
            })
            .unwrap();
        assert_eq!(ctx.last_error(), STATUS_SUCCESS);
    }

    #[test]
    fn test_wire_round_trip_through_surface() {
        let surface = surface();
        surface.registry().attach();
        surface.registry().attach();

        let (code, input) = wire::encode_request(&ControlRequest::SetRole {
            target: Target::Tag(tag()),
            role: Role::Base,
        });
        let reply = surface.handle_control(code, &input, 0, None).unwrap();
        assert!(reply.is_empty());

        let (code, input) = wire::encode_request(&ControlRequest::GetStatus {
            target: Target::Tag(tag()),
        });
        let reply = surface
            .handle_control(code, &input, wire::status_output_len(), None)
            .unwrap();
        let status = wire::decode_status(&reply).unwrap();
        assert_eq!(status.role, Role::Base);

        let reply = surface
            .handle_control(wire::IOCTL_ENUM_TAGS, &[], wire::tags_output_len(4), None)
            .unwrap();
        assert_eq!(wire::decode_tags(&reply), Ok(vec![tag()]));

        let reply = surface
            .handle_control(
                wire::IOCTL_ENUM_DEVICES,
                &[],
                wire::devices_output_len(1),
                None,
            )
            .unwrap_err();
        assert_eq!(reply, KbdLayError::BufferOverflow);
    }
}
