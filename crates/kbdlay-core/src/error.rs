// Kbdlay Error Taxonomy
// Status codes surfaced by every control operation and recorded as LastErrorCode

/// Result type for kbdlay operations
pub type KbdLayResult<T> = Result<T, KbdLayError>;

/// Status code recorded for a successful operation
pub const STATUS_SUCCESS: u32 = 0;

const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;
const STATUS_INVALID_BUFFER_SIZE: u32 = 0xC000_0206;
const STATUS_BUFFER_TOO_SMALL: u32 = 0xC000_0023;
const STATUS_BUFFER_OVERFLOW: u32 = 0x8000_0005;
const STATUS_NOT_FOUND: u32 = 0xC000_0225;
const STATUS_INSUFFICIENT_RESOURCES: u32 = 0xC000_009A;
const STATUS_SHARING_VIOLATION: u32 = 0xC000_0043;
const STATUS_INVALID_DEVICE_REQUEST: u32 = 0xC000_0010;
const STATUS_DEVICE_NOT_READY: u32 = 0xC000_00A3;

/// Errors reported by the remap core.
///
/// Every variant carries a stable numeric status (see [`KbdLayError::code`])
/// so it can be stored in a device's LastErrorCode and transported over the
/// control wire format unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KbdLayError {
    /// Malformed rule blob, out-of-range role/state value
    #[error("invalid parameter")]
    InvalidParameter,

    /// Embedded blob length is zero, too large, or exceeds the request buffer
    #[error("invalid buffer size")]
    InvalidBufferSize,

    /// Caller buffer cannot hold the fixed-size fields of the request or reply
    #[error("buffer too small")]
    BufferTooSmall,

    /// Enumeration output does not fit the caller-supplied capacity
    #[error("buffer overflow: output exceeds caller capacity")]
    BufferOverflow,

    /// No device carries the requested identity tag
    #[error("no device matches the requested identity tag")]
    NotFound,

    /// Allocation failed while building a rule table
    #[error("insufficient resources")]
    InsufficientResources,

    /// The device is already connected to an upstream consumer
    #[error("sharing violation: device already connected")]
    SharingViolation,

    /// Unknown control code or a request that is not valid in the current state
    #[error("invalid device request")]
    InvalidDeviceRequest,

    /// The registry is not ready to service requests
    #[error("device not ready")]
    DeviceNotReady,

    /// The lower device or original consumer rejected a forwarded request
    #[error("downstream failure: status {0:#010x}")]
    Downstream(u32),
}

impl KbdLayError {
    /// Stable numeric status for this error
    pub fn code(self) -> u32 {
        match self {
            KbdLayError::InvalidParameter => STATUS_INVALID_PARAMETER,
            KbdLayError::InvalidBufferSize => STATUS_INVALID_BUFFER_SIZE,
            KbdLayError::BufferTooSmall => STATUS_BUFFER_TOO_SMALL,
            KbdLayError::BufferOverflow => STATUS_BUFFER_OVERFLOW,
            KbdLayError::NotFound => STATUS_NOT_FOUND,
            KbdLayError::InsufficientResources => STATUS_INSUFFICIENT_RESOURCES,
            KbdLayError::SharingViolation => STATUS_SHARING_VIOLATION,
            KbdLayError::InvalidDeviceRequest => STATUS_INVALID_DEVICE_REQUEST,
            KbdLayError::DeviceNotReady => STATUS_DEVICE_NOT_READY,
            KbdLayError::Downstream(code) => code,
        }
    }

    /// Map a numeric status back to an error.
    ///
    /// Returns `None` for [`STATUS_SUCCESS`]. Codes outside the known set are
    /// treated as downstream failures.
    pub fn from_code(code: u32) -> Option<Self> {
        let err = match code {
            STATUS_SUCCESS => return None,
            STATUS_INVALID_PARAMETER => KbdLayError::InvalidParameter,
            STATUS_INVALID_BUFFER_SIZE => KbdLayError::InvalidBufferSize,
            STATUS_BUFFER_TOO_SMALL => KbdLayError::BufferTooSmall,
            STATUS_BUFFER_OVERFLOW => KbdLayError::BufferOverflow,
            STATUS_NOT_FOUND => KbdLayError::NotFound,
            STATUS_INSUFFICIENT_RESOURCES => KbdLayError::InsufficientResources,
            STATUS_SHARING_VIOLATION => KbdLayError::SharingViolation,
            STATUS_INVALID_DEVICE_REQUEST => KbdLayError::InvalidDeviceRequest,
            STATUS_DEVICE_NOT_READY => KbdLayError::DeviceNotReady,
            other => KbdLayError::Downstream(other),
        };
        Some(err)
    }

    /// True for the invalid-input category (never retried internally)
    pub fn is_invalid_input(self) -> bool {
        matches!(
            self,
            KbdLayError::InvalidParameter
                | KbdLayError::InvalidBufferSize
                | KbdLayError::BufferTooSmall
        )
    }
}

/// Convert an operation result into the status code stored as LastErrorCode
pub fn status_of<T>(result: &KbdLayResult<T>) -> u32 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(e) => e.code(),
    }
}
