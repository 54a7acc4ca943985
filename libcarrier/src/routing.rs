//! Routing rules select the domain key that an inbound datagram belongs to.
//!
//! A [`RoutingRule`] is consulted by the dispatcher for every datagram it receives, on whichever transport the
//! datagram arrived. The rule sees the transport family, the peer address and the raw payload, and must return
//! the same [`DomainKey`] every time it is given the same inputs. Rules must not perform I/O and must not keep
//! state that changes their answer, otherwise a peer exchanging several messages with us could bounce between
//! engines.
//!
//! Two stock rules are provided:
//!
//! - [`SoleKey`] routes everything to one key. This is the dispatcher default, and matches the single-engine setup.
//! - [`PortModulus`] routes on the peer's port number, which is enough to pin peers to one of two engines.
//!
//! Any closure with the right signature is also a rule; use [`from_fn`] to get the closure types inferred.

use crate::domain::{DomainKey, TransportDomain};
use std::net::SocketAddr;
use std::num::NonZeroU16;

pub trait RoutingRule: Send {
    fn route(&self, domain: TransportDomain, source: &SocketAddr, payload: &[u8]) -> DomainKey;
}

impl<F> RoutingRule for F
where
    F: Fn(TransportDomain, &SocketAddr, &[u8]) -> DomainKey + Send,
{
    fn route(&self, domain: TransportDomain, source: &SocketAddr, payload: &[u8]) -> DomainKey {
        self(domain, source, payload)
    }
}

/// Wrap a closure as a routing rule.
pub fn from_fn<F>(f: F) -> F
where
    F: Fn(TransportDomain, &SocketAddr, &[u8]) -> DomainKey + Send,
{
    f
}

/// Routes every datagram to the same key.
#[derive(Clone, Debug, Default)]
pub struct SoleKey(DomainKey);

impl SoleKey {
    pub fn new<K: Into<DomainKey>>(key: K) -> Self {
        Self(key.into())
    }
}

impl RoutingRule for SoleKey {
    fn route(&self, _: TransportDomain, _: &SocketAddr, _: &[u8]) -> DomainKey {
        self.0.clone()
    }
}

/// Routes on the peer's port: `port % modulus == 0` goes to `on_zero`, everything else to `otherwise`.
#[derive(Clone, Debug)]
pub struct PortModulus {
    modulus: NonZeroU16,
    on_zero: DomainKey,
    otherwise: DomainKey,
}

impl PortModulus {
    pub fn new<K1, K2>(modulus: NonZeroU16, on_zero: K1, otherwise: K2) -> Self
    where
        K1: Into<DomainKey>,
        K2: Into<DomainKey>,
    {
        Self { modulus, on_zero: on_zero.into(), otherwise: otherwise.into() }
    }

    pub fn modulus(&self) -> u16 {
        self.modulus.get()
    }
}

impl RoutingRule for PortModulus {
    fn route(&self, _: TransportDomain, source: &SocketAddr, _: &[u8]) -> DomainKey {
        if source.port() % self.modulus.get() == 0 {
            self.on_zero.clone()
        } else {
            self.otherwise.clone()
        }
    }
}
