//! Protocol engines, as seen by the dispatcher.
//!
//! An engine owns its identity, its security context and its PDU state machine; the dispatcher knows none of
//! that. It only needs somewhere to hand the datagrams that the routing rule assigned to the engine's domain key,
//! and a way to tell the engine that a correlated request went out.
//!
//! Engine callbacks run on the dispatcher's event loop and must not block. In particular, they must never fail on
//! a malformed payload: decoding errors are the engine's own business.

use libcarrier::{
    Delivery, DomainKey, EngineId, RequestCorrelator, RequestHandle, RequestOutcome, TransportError,
    TransportHandle, TransportState, UnknownHandleError,
};
use log::*;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

pub trait Engine: Send {
    fn id(&self) -> &EngineId;

    /// Handle a datagram routed to this engine.
    fn on_datagram(&mut self, ctx: &mut EngineContext<'_>, source: SocketAddr, payload: &[u8]);

    /// A correlated request from this engine was accepted by the transport, either sent or queued.
    fn on_request_sent(&mut self, _handle: RequestHandle, _destination: SocketAddr) {}

    /// A request from this engine completed outside the engine: a send failure, an external resolution (such as a
    /// timeout) or a cancellation. Not called for outcomes the engine delivers through [`EngineContext::resolve`].
    fn on_request_finished(&mut self, _handle: RequestHandle) {}
}

/// What an engine may touch while it handles a datagram: its own transport, and the pending requests.
pub struct EngineContext<'a> {
    transport: &'a mut dyn TransportHandle,
    correlator: &'a mut RequestCorrelator,
}

impl<'a> EngineContext<'a> {
    pub fn new(transport: &'a mut dyn TransportHandle, correlator: &'a mut RequestCorrelator) -> Self {
        Self { transport, correlator }
    }

    /// The domain key of the transport replies go out on.
    pub fn key(&self) -> &DomainKey {
        self.transport.key()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    /// Send an uncorrelated datagram through this engine's transport.
    pub fn reply(&mut self, payload: Vec<u8>, destination: SocketAddr) -> Result<Delivery, TransportError> {
        self.transport.send_message(payload, destination)
    }

    /// Deliver the outcome of a request this engine issued.
    pub fn resolve(&mut self, handle: RequestHandle, outcome: RequestOutcome) -> Result<(), UnknownHandleError> {
        self.correlator.resolve(handle, outcome)
    }

    pub fn is_pending(&self, handle: RequestHandle) -> bool {
        self.correlator.is_pending(handle)
    }
}

/// Treats any datagram from a peer as the acknowledgement of the oldest request still in flight to that peer.
///
/// Useful for notification originators talking to receivers that answer every message, where the content of the
/// answer does not matter.
pub struct PeerAckEngine {
    id: EngineId,
    in_flight: HashMap<SocketAddr, VecDeque<RequestHandle>>,
    destinations: HashMap<RequestHandle, SocketAddr>,
}

impl PeerAckEngine {
    pub fn new(id: EngineId) -> Self {
        Self { id, in_flight: HashMap::new(), destinations: HashMap::new() }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.values().map(VecDeque::len).sum()
    }
}

impl Engine for PeerAckEngine {
    fn id(&self) -> &EngineId {
        &self.id
    }

    fn on_datagram(&mut self, ctx: &mut EngineContext<'_>, source: SocketAddr, payload: &[u8]) {
        let Some(queue) = self.in_flight.get_mut(&source) else {
            debug!("Engine {}: unsolicited datagram ({} bytes) from {source}", self.id, payload.len());
            return;
        };
        // Handles may already have been resolved elsewhere, e.g. by a timeout. Skip those.
        while let Some(handle) = queue.pop_front() {
            self.destinations.remove(&handle);
            match ctx.resolve(handle, RequestOutcome::Success(Vec::new())) {
                Ok(()) => {
                    trace!("Engine {}: request {handle} acknowledged by {source}", self.id);
                    break;
                }
                Err(e) => trace!("Engine {}: {e}", self.id),
            }
        }
        if queue.is_empty() {
            self.in_flight.remove(&source);
        }
    }

    fn on_request_sent(&mut self, handle: RequestHandle, destination: SocketAddr) {
        self.in_flight.entry(destination).or_default().push_back(handle);
        self.destinations.insert(handle, destination);
    }

    fn on_request_finished(&mut self, handle: RequestHandle) {
        let Some(destination) = self.destinations.remove(&handle) else {
            return;
        };
        if let Some(queue) = self.in_flight.get_mut(&destination) {
            queue.retain(|h| *h != handle);
            if queue.is_empty() {
                self.in_flight.remove(&destination);
            }
        }
    }
}

/// Sends every datagram it receives straight back to where it came from.
pub struct EchoEngine {
    id: EngineId,
    echoed: u64,
}

impl EchoEngine {
    pub fn new(id: EngineId) -> Self {
        Self { id, echoed: 0 }
    }

    pub fn echoed(&self) -> u64 {
        self.echoed
    }
}

impl Engine for EchoEngine {
    fn id(&self) -> &EngineId {
        &self.id
    }

    fn on_datagram(&mut self, ctx: &mut EngineContext<'_>, source: SocketAddr, payload: &[u8]) {
        info!("Engine {}: {} bytes from {source} on {}", self.id, payload.len(), ctx.key());
        match ctx.reply(payload.to_vec(), source) {
            Ok(_) => self.echoed += 1,
            Err(e) => warn!("Engine {}: could not echo to {source}. {e}", self.id),
        }
    }
}
