// Kbdlay Chain Adapter
// Connect/disconnect protocol and batch relay between a device and its consumer

use std::sync::{Arc, Weak};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::chain::relay::RelayBuffer;
use crate::chain::{ConnectData, InputConsumer, InternalRequest, LowerDevice};
use crate::device::{DeviceContext, UpstreamSnapshot};
use crate::error::{KbdLayError, KbdLayResult};
use crate::input::ScanEvent;
use crate::transform::{RemapEngine, MAX_OUTPUT_EVENTS};

/// Sits between a device's lower stack and the consumer that connected to it.
///
/// On connect it captures the original consumer and registers itself
/// instead. Every event batch then runs through the engine and the output is
/// relayed to the captured consumer, while the producer is always told the
/// whole original batch was consumed.
///
/// `deliver` holds this adapter's relay lock while it calls the consumer, so
/// batches for one device are serialised and each batch reaches the consumer
/// contiguously. The consumer must not call `deliver` on the same adapter
/// from inside its own `deliver`: that deadlocks. Sending a disconnect
/// through `handle` from the consumer is fine and drops the rest of the
/// batch.
pub struct ChainAdapter {
    me: Weak<ChainAdapter>,
    ctx: Arc<DeviceContext>,
    engine: Arc<RemapEngine>,
    lower: Arc<dyn LowerDevice>,
    // serialises batches for this device; never held with the device lock
    relay: Mutex<RelayBuffer>,
}

impl ChainAdapter {
    pub fn new(
        ctx: Arc<DeviceContext>,
        engine: Arc<RemapEngine>,
        lower: Arc<dyn LowerDevice>,
    ) -> Arc<Self> {
        let capacity = engine.config().effective_relay_capacity();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            engine,
            lower,
            relay: Mutex::new(RelayBuffer::with_capacity(capacity)),
        })
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Handle an internal request travelling down the stack.
    ///
    /// Connect and disconnect are resolved here; any other request is
    /// relayed to the lower device untouched and resolved by it.
    pub fn handle(&self, request: InternalRequest) -> KbdLayResult<()> {
        match request {
            InternalRequest::Connect(data) => self.connect(data),
            InternalRequest::Disconnect => self.disconnect(),
            other => {
                trace!("{}: relaying {} request", self.ctx.handle(), other.name());
                self.lower.send(other)
            }
        }
    }

    fn connect(&self, data: ConnectData) -> KbdLayResult<()> {
        let handle = self.ctx.handle();
        let me = self.me.upgrade().ok_or(KbdLayError::DeviceNotReady)?;

        let generation = match self.ctx.begin_connect(data.consumer) {
            Ok(generation) => generation,
            Err(err) => {
                warn!("{}: connect rejected, already connected", handle);
                return Err(err);
            }
        };

        let substituted: Arc<dyn InputConsumer> = me;
        let result = self
            .lower
            .send(InternalRequest::Connect(ConnectData::new(substituted)));

        self.ctx.finish_connect(generation, result.is_ok());
        match &result {
            Ok(()) => debug!("{}: connected", handle),
            Err(err) => {
                warn!("{}: downstream connect failed: {}", handle, err);
                self.ctx.record(&result);
            }
        }
        result
    }

    fn disconnect(&self) -> KbdLayResult<()> {
        let handle = self.ctx.handle();
        if !self.ctx.begin_disconnect() {
            debug!("{}: disconnect with no consumer attached", handle);
        }

        let result = self.lower.send(InternalRequest::Disconnect);

        // the captured consumer is dropped whatever the lower layer says
        self.ctx.clear_upstream();
        match &result {
            Ok(()) => debug!("{}: disconnected", handle),
            Err(err) => {
                warn!("{}: downstream disconnect failed: {}", handle, err);
                self.ctx.record(&result);
            }
        }
        result
    }

    fn flush(&self, relay: &mut RelayBuffer, upstream: &UpstreamSnapshot) -> bool {
        if relay.is_empty() {
            return true;
        }
        if !self.ctx.upstream_is_live(upstream.generation) {
            relay.clear();
            return false;
        }
        let sent = relay.len();
        let taken = upstream.consumer.deliver(relay.as_slice());
        if taken < sent {
            warn!(
                "{}: consumer took {} of {} relayed events",
                self.ctx.handle(),
                taken,
                sent
            );
        }
        relay.clear();
        true
    }

    fn deliver_one(&self, event: &ScanEvent, upstream: &UpstreamSnapshot) -> bool {
        if !self.ctx.upstream_is_live(upstream.generation) {
            return false;
        }
        upstream.consumer.deliver(std::slice::from_ref(event));
        true
    }

    fn relay_batch(&self, events: &[ScanEvent], upstream: &UpstreamSnapshot) {
        let mut relay = self.relay.lock();
        relay.clear();

        for event in events {
            let out = self.engine.transform(&self.ctx, event, MAX_OUTPUT_EVENTS);

            if out.is_empty() {
                // forward the raw event alone, after anything already staged
                if !self.flush(&mut relay, upstream) || !self.deliver_one(event, upstream) {
                    return self.abandon(&mut relay);
                }
                continue;
            }

            if relay.would_overflow(out.events.len()) && !self.flush(&mut relay, upstream) {
                return self.abandon(&mut relay);
            }
            relay.push_all(&out.events);
        }

        if !self.flush(&mut relay, upstream) {
            self.abandon(&mut relay);
        }
    }

    fn abandon(&self, relay: &mut RelayBuffer) {
        relay.clear();
        debug!(
            "{}: consumer disconnected mid-batch, dropping remaining output",
            self.ctx.handle()
        );
    }
}

impl InputConsumer for ChainAdapter {
    /// Relay a batch; always reports the full original batch as consumed
    fn deliver(&self, events: &[ScanEvent]) -> usize {
        let count = events.len();
        if count == 0 {
            return 0;
        }

        match self.ctx.upstream() {
            Some(upstream) => self.relay_batch(events, &upstream),
            None => trace!(
                "{}: dropping {} events, no consumer connected",
                self.ctx.handle(),
                count
            ),
        }
        count
    }
}
