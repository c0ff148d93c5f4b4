// Kbdlay Chain Module
// Interception of the keyboard event-delivery hookup
//
// A device stack delivers raw events to whichever consumer was handed over
// in the connect request. The adapter captures that consumer, registers
// itself in its place, and relays engine output to the captured consumer.

mod adapter;
mod relay;

use std::fmt;
use std::sync::Arc;

use crate::error::KbdLayResult;
use crate::input::ScanEvent;

pub use adapter::ChainAdapter;
pub use relay::RelayBuffer;

/// Receiver of keyboard events.
///
/// Returns how many of `events` were consumed.
pub trait InputConsumer: Send + Sync {
    fn deliver(&self, events: &[ScanEvent]) -> usize;
}

/// Next layer down the device stack.
///
/// `send` resolves the request synchronously; an error is the downstream
/// layer's rejection.
pub trait LowerDevice: Send + Sync {
    fn send(&self, request: InternalRequest) -> KbdLayResult<()>;
}

/// Payload of a connect request: who should receive events
#[derive(Clone)]
pub struct ConnectData {
    pub consumer: Arc<dyn InputConsumer>,
}

impl ConnectData {
    pub fn new(consumer: Arc<dyn InputConsumer>) -> Self {
        Self { consumer }
    }
}

impl fmt::Debug for ConnectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectData").finish_non_exhaustive()
    }
}

/// Internal device-stack requests seen by the adapter
#[derive(Debug, Clone)]
pub enum InternalRequest {
    /// Hook a consumer to the device's event stream
    Connect(ConnectData),
    /// Unhook the current consumer
    Disconnect,
    /// Anything else; relayed untouched
    Other { code: u32, payload: Vec<u8> },
}

impl InternalRequest {
    pub fn name(&self) -> &'static str {
        match self {
            InternalRequest::Connect(_) => "connect",
            InternalRequest::Disconnect => "disconnect",
            InternalRequest::Other { .. } => "other",
        }
    }
}
