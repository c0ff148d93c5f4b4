// Kbdlay Control Wire Format
// Packed little-endian request/response layouts for the control codes
//
// Requests (GUID = 16 raw bytes):
//   SET_ROLE / SET_STATE           { value:u32 }
//   SET_RULE_BLOB                  blob bytes
//   SET_ROLE_EX / SET_STATE_EX     { tag:GUID, value:u32 }
//   SET_RULE_BLOB_EX               { tag:GUID, blob_size:u32, blob[blob_size] }
//   GET_STATUS_EX                  { tag:GUID }
// Responses:
//   status       { role:u32, state:u32, remap:u64, pass:u64, unmapped:u64,
//                  toggles:u64, last_error:u32, tag:GUID }
//   tags         { count:u32, tags[count] }
//   devices      { returned:u32, total:u32, { tag:GUID, has_tag:u32 }[returned] }

use crate::control::{ControlRequest, ControlResponse, Target};
use crate::device::{CounterSnapshot, DeviceHandle, DeviceState, DeviceStatus, IdentityTag, Role};
use crate::error::{KbdLayError, KbdLayResult};
use crate::registry::DeviceList;
use crate::rules::{MAX_RULE_BLOB_BYTES, RULE_BLOB_HEADER_SIZE};

pub const FILE_DEVICE_UNKNOWN: u32 = 0x22;
pub const METHOD_BUFFERED: u32 = 0;
pub const FILE_READ_ACCESS: u32 = 0x1;
pub const FILE_WRITE_ACCESS: u32 = 0x2;

/// Compose a control code from its fields
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

const fn kbdlay_code(function: u32, access: u32) -> u32 {
    ctl_code(FILE_DEVICE_UNKNOWN, function, METHOD_BUFFERED, access)
}

pub const IOCTL_SET_ROLE: u32 = kbdlay_code(0x900, FILE_WRITE_ACCESS);
pub const IOCTL_SET_STATE: u32 = kbdlay_code(0x901, FILE_WRITE_ACCESS);
pub const IOCTL_SET_RULE_BLOB: u32 = kbdlay_code(0x902, FILE_WRITE_ACCESS);
pub const IOCTL_GET_STATUS: u32 = kbdlay_code(0x903, FILE_READ_ACCESS);
pub const IOCTL_SET_ROLE_EX: u32 = kbdlay_code(0x904, FILE_WRITE_ACCESS);
pub const IOCTL_SET_STATE_EX: u32 = kbdlay_code(0x905, FILE_WRITE_ACCESS);
pub const IOCTL_SET_RULE_BLOB_EX: u32 = kbdlay_code(0x906, FILE_WRITE_ACCESS);
pub const IOCTL_GET_STATUS_EX: u32 = kbdlay_code(0x907, FILE_READ_ACCESS);
pub const IOCTL_ENUM_TAGS: u32 = kbdlay_code(0x908, FILE_READ_ACCESS);
pub const IOCTL_ENUM_DEVICES: u32 = kbdlay_code(0x909, FILE_READ_ACCESS);

pub const GUID_SIZE: usize = 16;
pub const STATUS_OUTPUT_SIZE: usize = 4 + 4 + 8 * 4 + 4 + GUID_SIZE;
pub const ENUM_TAGS_HEADER_SIZE: usize = 4;
pub const ENUM_DEVICES_HEADER_SIZE: usize = 8;
pub const DEVICE_INFO_SIZE: usize = GUID_SIZE + 4;

const BLOB_EX_HEADER_SIZE: usize = GUID_SIZE + 4;

fn u32_at(bytes: &[u8], offset: usize) -> KbdLayResult<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(KbdLayError::BufferTooSmall)
}

fn u64_at(bytes: &[u8], offset: usize) -> KbdLayResult<u64> {
    bytes
        .get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(KbdLayError::BufferTooSmall)
}

fn tag_at(bytes: &[u8], offset: usize) -> KbdLayResult<IdentityTag> {
    bytes
        .get(offset..offset + GUID_SIZE)
        .and_then(|b| <[u8; GUID_SIZE]>::try_from(b).ok())
        .map(IdentityTag::from_bytes)
        .ok_or(KbdLayError::BufferTooSmall)
}

fn record_capacity(output_len: usize, header: usize, record: usize) -> KbdLayResult<usize> {
    if output_len < header {
        return Err(KbdLayError::BufferTooSmall);
    }
    match (output_len - header) / record {
        0 => Err(KbdLayError::BufferTooSmall),
        capacity => Ok(capacity),
    }
}

/// Decode a control request.
///
/// `output_len` is the size of the caller's reply buffer; `device` is the
/// implicit target of the per-device codes, absent on the control device.
pub fn decode_request(
    code: u32,
    input: &[u8],
    output_len: usize,
    device: Option<DeviceHandle>,
) -> KbdLayResult<ControlRequest> {
    let implicit = || {
        device
            .map(Target::Device)
            .ok_or(KbdLayError::InvalidDeviceRequest)
    };

    match code {
        IOCTL_SET_ROLE => Ok(ControlRequest::SetRole {
            target: implicit()?,
            role: Role::from_raw(u32_at(input, 0)?)?,
        }),
        IOCTL_SET_STATE => Ok(ControlRequest::SetState {
            target: implicit()?,
            state: DeviceState::from_raw(u32_at(input, 0)?)?,
        }),
        IOCTL_SET_RULE_BLOB => {
            let target = implicit()?;
            if input.len() < RULE_BLOB_HEADER_SIZE {
                return Err(KbdLayError::BufferTooSmall);
            }
            Ok(ControlRequest::SetRuleBlob {
                target,
                blob: input.to_vec(),
            })
        }
        IOCTL_GET_STATUS => {
            let target = implicit()?;
            if output_len < STATUS_OUTPUT_SIZE {
                return Err(KbdLayError::BufferTooSmall);
            }
            Ok(ControlRequest::GetStatus { target })
        }
        IOCTL_SET_ROLE_EX => {
            let tag = tag_at(input, 0)?;
            let raw = u32_at(input, GUID_SIZE)?;
            Ok(ControlRequest::SetRole {
                target: Target::Tag(tag),
                role: Role::from_raw(raw)?,
            })
        }
        IOCTL_SET_STATE_EX => {
            let tag = tag_at(input, 0)?;
            let raw = u32_at(input, GUID_SIZE)?;
            Ok(ControlRequest::SetState {
                target: Target::Tag(tag),
                state: DeviceState::from_raw(raw)?,
            })
        }
        IOCTL_SET_RULE_BLOB_EX => {
            let tag = tag_at(input, 0)?;
            let size = u32_at(input, GUID_SIZE)? as usize;
            let present = input.len() - BLOB_EX_HEADER_SIZE;
            if size == 0 || size > MAX_RULE_BLOB_BYTES || size > present {
                return Err(KbdLayError::InvalidBufferSize);
            }
            Ok(ControlRequest::SetRuleBlob {
                target: Target::Tag(tag),
                blob: input[BLOB_EX_HEADER_SIZE..BLOB_EX_HEADER_SIZE + size].to_vec(),
            })
        }
        IOCTL_GET_STATUS_EX => {
            let tag = tag_at(input, 0)?;
            if output_len < STATUS_OUTPUT_SIZE {
                return Err(KbdLayError::BufferTooSmall);
            }
            Ok(ControlRequest::GetStatus {
                target: Target::Tag(tag),
            })
        }
        IOCTL_ENUM_TAGS => Ok(ControlRequest::EnumerateTags {
            capacity: record_capacity(output_len, ENUM_TAGS_HEADER_SIZE, GUID_SIZE)?,
        }),
        IOCTL_ENUM_DEVICES => Ok(ControlRequest::EnumerateDevices {
            capacity: record_capacity(output_len, ENUM_DEVICES_HEADER_SIZE, DEVICE_INFO_SIZE)?,
        }),
        _ => Err(KbdLayError::InvalidDeviceRequest),
    }
}

/// Encode a request as (control code, input bytes).
///
/// The reply buffer size is the caller's to choose; see
/// [`status_output_len`], [`tags_output_len`] and [`devices_output_len`].
pub fn encode_request(request: &ControlRequest) -> (u32, Vec<u8>) {
    let mut out = Vec::new();
    let code = match request {
        ControlRequest::SetRole { target, role } => {
            let code = match target {
                Target::Device(_) => IOCTL_SET_ROLE,
                Target::Tag(tag) => {
                    out.extend_from_slice(tag.as_bytes());
                    IOCTL_SET_ROLE_EX
                }
            };
            out.extend_from_slice(&role.raw().to_le_bytes());
            code
        }
        ControlRequest::SetState { target, state } => {
            let code = match target {
                Target::Device(_) => IOCTL_SET_STATE,
                Target::Tag(tag) => {
                    out.extend_from_slice(tag.as_bytes());
                    IOCTL_SET_STATE_EX
                }
            };
            out.extend_from_slice(&state.raw().to_le_bytes());
            code
        }
        ControlRequest::SetRuleBlob { target, blob } => match target {
            Target::Device(_) => {
                out.extend_from_slice(blob);
                IOCTL_SET_RULE_BLOB
            }
            Target::Tag(tag) => {
                out.extend_from_slice(tag.as_bytes());
                out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
                out.extend_from_slice(blob);
                IOCTL_SET_RULE_BLOB_EX
            }
        },
        ControlRequest::GetStatus { target } => match target {
            Target::Device(_) => IOCTL_GET_STATUS,
            Target::Tag(tag) => {
                out.extend_from_slice(tag.as_bytes());
                IOCTL_GET_STATUS_EX
            }
        },
        ControlRequest::EnumerateTags { .. } => IOCTL_ENUM_TAGS,
        ControlRequest::EnumerateDevices { .. } => IOCTL_ENUM_DEVICES,
    };
    (code, out)
}

/// Reply buffer size for a status query
pub fn status_output_len() -> usize {
    STATUS_OUTPUT_SIZE
}

/// Reply buffer size for a tag enumeration of up to `capacity` tags
pub fn tags_output_len(capacity: usize) -> usize {
    ENUM_TAGS_HEADER_SIZE + capacity * GUID_SIZE
}

/// Reply buffer size for a device enumeration of up to `capacity` devices
pub fn devices_output_len(capacity: usize) -> usize {
    ENUM_DEVICES_HEADER_SIZE + capacity * DEVICE_INFO_SIZE
}

fn encode_status(status: &DeviceStatus, out: &mut Vec<u8>) {
    out.extend_from_slice(&status.role.raw().to_le_bytes());
    out.extend_from_slice(&status.state.raw().to_le_bytes());
    out.extend_from_slice(&status.counters.remap_hits.to_le_bytes());
    out.extend_from_slice(&status.counters.pass_throughs.to_le_bytes());
    out.extend_from_slice(&status.counters.unmapped.to_le_bytes());
    out.extend_from_slice(&status.counters.shift_toggles.to_le_bytes());
    out.extend_from_slice(&status.last_error.to_le_bytes());
    out.extend_from_slice(status.tag.unwrap_or(IdentityTag::NULL).as_bytes());
}

fn encode_devices(list: &DeviceList, out: &mut Vec<u8>) {
    out.extend_from_slice(&(list.devices.len() as u32).to_le_bytes());
    out.extend_from_slice(&(list.total as u32).to_le_bytes());
    for info in &list.devices {
        out.extend_from_slice(info.tag.as_bytes());
        out.extend_from_slice(&u32::from(info.has_tag).to_le_bytes());
    }
}

/// Encode a reply; set operations reply with no bytes
pub fn encode_response(response: &ControlResponse) -> Vec<u8> {
    let mut out = Vec::new();
    match response {
        ControlResponse::Applied { .. } => {}
        ControlResponse::Status(status) => encode_status(status, &mut out),
        ControlResponse::Tags(tags) => {
            out.extend_from_slice(&(tags.len() as u32).to_le_bytes());
            for tag in tags {
                out.extend_from_slice(tag.as_bytes());
            }
        }
        ControlResponse::Devices(list) => encode_devices(list, &mut out),
    }
    out
}

/// Decode a status reply
pub fn decode_status(bytes: &[u8]) -> KbdLayResult<DeviceStatus> {
    if bytes.len() < STATUS_OUTPUT_SIZE {
        return Err(KbdLayError::BufferTooSmall);
    }
    Ok(DeviceStatus {
        role: Role::from_raw(u32_at(bytes, 0)?)?,
        state: DeviceState::from_raw(u32_at(bytes, 4)?)?,
        counters: CounterSnapshot {
            remap_hits: u64_at(bytes, 8)?,
            pass_throughs: u64_at(bytes, 16)?,
            unmapped: u64_at(bytes, 24)?,
            shift_toggles: u64_at(bytes, 32)?,
        },
        last_error: u32_at(bytes, 40)?,
        tag: tag_at(bytes, 44)?.non_null(),
    })
}

/// Decode a tag enumeration reply
pub fn decode_tags(bytes: &[u8]) -> KbdLayResult<Vec<IdentityTag>> {
    let count = u32_at(bytes, 0)? as usize;
    (0..count)
        .map(|i| tag_at(bytes, ENUM_TAGS_HEADER_SIZE + i * GUID_SIZE))
        .collect()
}

/// One record of a device enumeration reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRecord {
    pub tag: IdentityTag,
    pub has_tag: bool,
}

/// Decode a device enumeration reply into (total, records)
pub fn decode_devices(bytes: &[u8]) -> KbdLayResult<(u32, Vec<DeviceRecord>)> {
    let returned = u32_at(bytes, 0)? as usize;
    let total = u32_at(bytes, 4)?;
    let records = (0..returned)
        .map(|i| {
            let offset = ENUM_DEVICES_HEADER_SIZE + i * DEVICE_INFO_SIZE;
            Ok(DeviceRecord {
                tag: tag_at(bytes, offset)?,
                has_tag: u32_at(bytes, offset + GUID_SIZE)? != 0,
            })
        })
        .collect::<KbdLayResult<Vec<_>>>()?;
    Ok((total, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceInfo;
    use crate::rules::RuleBlobBuilder;

    fn tag() -> IdentityTag {
        IdentityTag::from_bytes([0xA5; 16])
    }

    #[test]
    fn test_control_code_values() {
        assert_eq!(IOCTL_SET_ROLE, 0x0022_a400);
        assert_eq!(IOCTL_GET_STATUS, 0x0022_640c);
        assert_eq!(IOCTL_ENUM_DEVICES, 0x0022_6424);
    }

    #[test]
    fn test_status_layout_size() {
        assert_eq!(STATUS_OUTPUT_SIZE, 60);
        let bytes = encode_response(&ControlResponse::Status(DeviceStatus::default()));
        assert_eq!(bytes.len(), STATUS_OUTPUT_SIZE);
    }

    #[test]
    fn test_decode_set_role_ex() {
        let mut input = tag().as_bytes().to_vec();
        input.extend_from_slice(&2u32.to_le_bytes());
        let request = decode_request(IOCTL_SET_ROLE_EX, &input, 0, None).unwrap();
        assert_eq!(
            request,
            ControlRequest::SetRole {
                target: Target::Tag(tag()),
                role: Role::Remap
            }
        );
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut input = tag().as_bytes().to_vec();
        input.extend_from_slice(&7u32.to_le_bytes());
        assert_eq!(
            decode_request(IOCTL_SET_STATE_EX, &input, 0, None),
            Err(KbdLayError::InvalidParameter)
        );
        assert_eq!(
            decode_request(IOCTL_SET_ROLE, &3u32.to_le_bytes(), 0, Some(DeviceHandle(1))),
            Err(KbdLayError::InvalidParameter)
        );
    }

    #[test]
    fn test_short_input_is_buffer_too_small() {
        assert_eq!(
            decode_request(IOCTL_SET_ROLE_EX, &[0u8; 18], 0, None),
            Err(KbdLayError::BufferTooSmall)
        );
        assert_eq!(
            decode_request(IOCTL_SET_RULE_BLOB, &[0u8; 8], 0, Some(DeviceHandle(1))),
            Err(KbdLayError::BufferTooSmall)
        );
    }

    #[test]
    fn test_rule_blob_ex_size_checks() {
        let blob = RuleBlobBuilder::new().build();
        let frame = |size: u32, body: &[u8]| {
            let mut input = tag().as_bytes().to_vec();
            input.extend_from_slice(&size.to_le_bytes());
            input.extend_from_slice(body);
            input
        };

        let ok = decode_request(
            IOCTL_SET_RULE_BLOB_EX,
            &frame(blob.len() as u32, &blob),
            0,
            None,
        )
        .unwrap();
        assert_eq!(
            ok,
            ControlRequest::SetRuleBlob {
                target: Target::Tag(tag()),
                blob: blob.clone()
            }
        );

        for size in [0, blob.len() as u32 + 1, (MAX_RULE_BLOB_BYTES + 1) as u32] {
            assert_eq!(
                decode_request(IOCTL_SET_RULE_BLOB_EX, &frame(size, &blob), 0, None),
                Err(KbdLayError::InvalidBufferSize)
            );
        }
    }

    #[test]
    fn test_enum_capacity_from_output_len() {
        assert_eq!(
            decode_request(IOCTL_ENUM_TAGS, &[], tags_output_len(3), None),
            Ok(ControlRequest::EnumerateTags { capacity: 3 })
        );
        assert_eq!(
            decode_request(IOCTL_ENUM_TAGS, &[], 2, None),
            Err(KbdLayError::BufferTooSmall)
        );
        assert_eq!(
            decode_request(IOCTL_ENUM_DEVICES, &[], ENUM_DEVICES_HEADER_SIZE + 19, None),
            Err(KbdLayError::BufferTooSmall)
        );
    }

    #[test]
    fn test_per_device_codes_need_implicit_device() {
        assert_eq!(
            decode_request(IOCTL_GET_STATUS, &[], STATUS_OUTPUT_SIZE, None),
            Err(KbdLayError::InvalidDeviceRequest)
        );
        assert_eq!(
            decode_request(0x0022_0000, &[], 0, None),
            Err(KbdLayError::InvalidDeviceRequest)
        );
    }

    #[test]
    fn test_status_reply_round_trip() {
        let status = DeviceStatus {
            role: Role::Remap,
            state: DeviceState::Active,
            counters: CounterSnapshot {
                remap_hits: 5,
                pass_throughs: 6,
                unmapped: 7,
                shift_toggles: 2,
            },
            last_error: KbdLayError::NotFound.code(),
            tag: Some(tag()),
        };
        let bytes = encode_response(&ControlResponse::Status(status));
        assert_eq!(decode_status(&bytes), Ok(status));
    }

    #[test]
    fn test_devices_reply_layout() {
        let list = DeviceList {
            total: 2,
            devices: vec![
                DeviceInfo {
                    handle: DeviceHandle(1),
                    tag: IdentityTag::NULL,
                    has_tag: false,
                },
                DeviceInfo {
                    handle: DeviceHandle(2),
                    tag: tag(),
                    has_tag: true,
                },
            ],
        };
        let bytes = encode_response(&ControlResponse::Devices(list));
        assert_eq!(bytes.len(), devices_output_len(2));
        let (total, records) = decode_devices(&bytes).unwrap();
        assert_eq!(total, 2);
        assert!(!records[0].has_tag);
        assert_eq!(records[1].tag, tag());
    }

    #[test]
    fn test_encode_request_matches_decode() {
        let request = ControlRequest::SetState {
            target: Target::Tag(tag()),
            state: DeviceState::BypassSoft,
        };
        let (code, input) = encode_request(&request);
        assert_eq!(code, IOCTL_SET_STATE_EX);
        assert_eq!(decode_request(code, &input, 0, None), Ok(request));
    }
}
