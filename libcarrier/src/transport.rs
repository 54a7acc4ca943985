//! A connection-oriented wrapper around one datagram endpoint.
//!
//! The underlying socket becomes usable asynchronously, some time after the transport was created. Callers do not
//! need to care: a [`Transport`] accepts writes in any state except [`TransportState::Closed`], queueing them
//! while [`TransportState::Unconnected`] and flushing the queue in FIFO order as soon as
//! [`Transport::on_connection_established`] hands it a [`DatagramSink`].
//!
//! A connected sink may also refuse a write with [`ErrorKind::WouldBlock`] when its send buffer is full. That is not
//! a failure: the write stays at the head of the queue, later writes queue behind it, and the owner calls
//! [`Transport::flush`] once the sink is writable again.
//!
//! ```text
//!                  on_connection_established
//!   Unconnected ─────────────────────────────▶ Connected
//!        ▲                                         │
//!        └──────── on_connection_lost(Rearm) ──────┤
//!                                                  │ on_connection_lost(Close) / close()
//!   Closed ◀───────────────────────────────────────┘
//! ```
//!
//! Failed writes are never dropped silently. They are returned to the caller as [`FailedWrite`]s, carrying the
//! request handle (if any) so that the outcome can be delivered to whoever is waiting on it.

use crate::correlator::RequestHandle;
use crate::domain::{DomainKey, TransportDomain};
use crate::error::TransportError;
use futures::channel::mpsc;
use log::*;
use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::io::ErrorKind;
use std::net::SocketAddr;

/// The I/O layer's send primitive. Implementations must not block.
pub trait DatagramSink {
    fn send_to(&mut self, payload: &[u8], destination: SocketAddr) -> std::io::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Unconnected,
    Connected,
    Closed,
}

impl Display for TransportState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Unconnected => write!(f, "Unconnected"),
            TransportState::Connected => write!(f, "Connected"),
            TransportState::Closed => write!(f, "Closed"),
        }
    }
}

/// What a transport does when its endpoint goes away.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Go back to `Unconnected` and keep queueing until the endpoint is re-established.
    Rearm,
    /// Go to `Closed`. Everything still queued is reported as failed.
    #[default]
    Close,
}

/// What happened to an accepted write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingWrite {
    pub payload: Vec<u8>,
    pub destination: SocketAddr,
    pub handle: Option<RequestHandle>,
}

impl PendingWrite {
    pub fn new(payload: Vec<u8>, destination: SocketAddr) -> Self {
        Self { payload, destination, handle: None }
    }

    pub fn correlated(payload: Vec<u8>, destination: SocketAddr, handle: RequestHandle) -> Self {
        Self { payload, destination, handle: Some(handle) }
    }
}

#[derive(Debug)]
pub struct FailedWrite {
    pub write: PendingWrite,
    pub error: TransportError,
}

/// A datagram received on a transport, waiting to be routed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundDatagram {
    /// The key of the transport the datagram arrived on.
    pub key: DomainKey,
    pub domain: TransportDomain,
    pub source: SocketAddr,
    pub payload: Vec<u8>,
}

enum Link<S> {
    Unconnected,
    Connected(S),
    Closed,
}

pub struct Transport<S> {
    key: DomainKey,
    domain: TransportDomain,
    link: Link<S>,
    write_queue: VecDeque<PendingWrite>,
    receiver: Option<mpsc::UnboundedSender<InboundDatagram>>,
}

impl<S: DatagramSink> Debug for Transport<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport({}, {}, {}, {} queued)", self.key, self.domain, self.state(), self.write_queue.len())
    }
}

impl<S: DatagramSink> Transport<S> {
    pub fn new(key: DomainKey, domain: TransportDomain) -> Self {
        Self { key, domain, link: Link::Unconnected, write_queue: VecDeque::new(), receiver: None }
    }

    /// Bind the queue that received datagrams are scheduled onto.
    pub fn set_receiver(&mut self, receiver: mpsc::UnboundedSender<InboundDatagram>) {
        self.receiver = Some(receiver);
    }

    pub fn key(&self) -> &DomainKey {
        &self.key
    }

    pub fn domain(&self) -> TransportDomain {
        self.domain
    }

    pub fn state(&self) -> TransportState {
        match self.link {
            Link::Unconnected => TransportState::Unconnected,
            Link::Connected(_) => TransportState::Connected,
            Link::Closed => TransportState::Closed,
        }
    }

    /// The writes waiting for the connection, in the order they will be sent.
    pub fn queued(&self) -> impl Iterator<Item = &PendingWrite> {
        self.write_queue.iter()
    }

    pub fn send_message(&mut self, payload: Vec<u8>, destination: SocketAddr) -> Result<Delivery, TransportError> {
        self.write(PendingWrite::new(payload, destination))
    }

    /// Send `write` now if connected, or queue it until the connection is ready.
    pub fn write(&mut self, write: PendingWrite) -> Result<Delivery, TransportError> {
        match &mut self.link {
            // Keep FIFO order behind a backlog
            Link::Connected(_) if !self.write_queue.is_empty() => {
                trace!("[{}] backlogged, queuing for {}", self.key, write.destination);
                self.write_queue.push_back(write);
                Ok(Delivery::Queued)
            }
            Link::Connected(sink) => {
                trace!(
                    "[{}] sending to {}: {}",
                    self.key,
                    write.destination,
                    hex::encode(&write.payload)
                );
                match sink.send_to(&write.payload, write.destination) {
                    Ok(()) => Ok(Delivery::Sent),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        debug!("[{}] send buffer full. Queuing until writable.", self.key);
                        self.write_queue.push_back(write);
                        Ok(Delivery::Queued)
                    }
                    Err(source) => Err(TransportError::SendFailure { destination: write.destination, source }),
                }
            }
            Link::Unconnected => {
                trace!(
                    "[{}] queuing for {}: {}",
                    self.key,
                    write.destination,
                    hex::encode(&write.payload)
                );
                self.write_queue.push_back(write);
                Ok(Delivery::Queued)
            }
            Link::Closed => Err(TransportError::Closed),
        }
    }

    /// The endpoint is ready. Flush every queued write, in order, and return the ones that failed.
    ///
    /// A failed write does not stop the flush; every queued entry gets its own attempt. A full send buffer does:
    /// the rest of the queue waits for [`Transport::flush`].
    pub fn on_connection_established(&mut self, sink: S) -> Result<Vec<FailedWrite>, TransportError> {
        match self.link {
            Link::Closed => return Err(TransportError::Closed),
            Link::Connected(_) => warn!("[{}] connection established twice. Replacing the endpoint.", self.key),
            Link::Unconnected => debug!("[{}] connection established", self.key),
        }
        self.link = Link::Connected(sink);
        Ok(self.flush())
    }

    /// Whether writes are waiting on a connected sink to become writable again.
    pub fn is_backlogged(&self) -> bool {
        matches!(self.link, Link::Connected(_)) && !self.write_queue.is_empty()
    }

    /// Send queued writes until the queue is empty or the sink would block. Does nothing unless connected.
    pub fn flush(&mut self) -> Vec<FailedWrite> {
        let Link::Connected(sink) = &mut self.link else {
            return Vec::new();
        };
        let mut failures = Vec::new();
        while let Some(write) = self.write_queue.pop_front() {
            trace!("[{}] flushing to {}: {}", self.key, write.destination, hex::encode(&write.payload));
            match sink.send_to(&write.payload, write.destination) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    debug!("[{}] send buffer full with {} writes queued", self.key, self.write_queue.len() + 1);
                    self.write_queue.push_front(write);
                    break;
                }
                Err(source) => {
                    let error = TransportError::SendFailure { destination: write.destination, source };
                    warn!("[{}] queued write failed. {error}", self.key);
                    failures.push(FailedWrite { write, error });
                }
            }
        }
        failures
    }

    /// Hand a received datagram to the receiver. The receiver runs on a later turn of the event loop.
    pub fn on_datagram_received(&self, payload: Vec<u8>, source: SocketAddr) -> Result<(), TransportError> {
        if matches!(self.link, Link::Closed) {
            return Err(TransportError::Closed);
        }
        let receiver = self.receiver.as_ref().ok_or(TransportError::NoReceiverConfigured)?;
        trace!("[{}] received from {source}: {}", self.key, hex::encode(&payload));
        let datagram = InboundDatagram { key: self.key.clone(), domain: self.domain, source, payload };
        receiver.unbounded_send(datagram).map_err(|_| TransportError::NoReceiverConfigured)
    }

    /// The endpoint went away. Returns the writes that can no longer be delivered.
    pub fn on_connection_lost(&mut self, policy: ReconnectPolicy) -> Vec<FailedWrite> {
        if matches!(self.link, Link::Closed) {
            return Vec::new();
        }
        match policy {
            ReconnectPolicy::Rearm => {
                info!("[{}] connection lost. Queueing writes until it is re-established.", self.key);
                self.link = Link::Unconnected;
                Vec::new()
            }
            ReconnectPolicy::Close => {
                info!("[{}] connection lost. Closing the transport.", self.key);
                self.close_link()
                    .into_iter()
                    .map(|write| FailedWrite { write, error: TransportError::Closed })
                    .collect()
            }
        }
    }

    /// Close the transport. Returns `None` if it was already closed, otherwise the writes that were never sent.
    pub fn close(&mut self) -> Option<Vec<PendingWrite>> {
        if matches!(self.link, Link::Closed) {
            return None;
        }
        debug!("[{}] closing transport", self.key);
        Some(self.close_link())
    }

    fn close_link(&mut self) -> Vec<PendingWrite> {
        self.link = Link::Closed;
        self.receiver = None;
        self.write_queue.drain(..).collect()
    }
}

/// The engine-facing view of a transport: engines may reply through it, but not reconfigure it.
pub trait TransportHandle {
    fn key(&self) -> &DomainKey;
    fn state(&self) -> TransportState;
    fn send_message(&mut self, payload: Vec<u8>, destination: SocketAddr) -> Result<Delivery, TransportError>;
}

impl<S: DatagramSink> TransportHandle for Transport<S> {
    fn key(&self) -> &DomainKey {
        Transport::key(self)
    }

    fn state(&self) -> TransportState {
        Transport::state(self)
    }

    fn send_message(&mut self, payload: Vec<u8>, destination: SocketAddr) -> Result<Delivery, TransportError> {
        Transport::send_message(self, payload, destination)
    }
}
