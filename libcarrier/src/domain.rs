use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

/// The key used when no routing rule has been installed and every datagram goes to a single engine.
pub const DEFAULT_DOMAIN_KEY: &str = "default";

/// The label under which a transport, and the engines answering on it, are registered with a dispatcher.
///
/// Keys are opaque to the dispatcher. They are only compared, hashed and logged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainKey(String);

impl DomainKey {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DomainKey {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN_KEY)
    }
}

impl Display for DomainKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DomainKey {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for DomainKey {
    fn from(label: String) -> Self {
        Self(label)
    }
}

/// The family of the datagram endpoint a message travelled over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportDomain {
    UdpIpv4,
    UdpIpv6,
}

impl TransportDomain {
    pub fn for_address(address: &SocketAddr) -> Self {
        match address {
            SocketAddr::V4(_) => TransportDomain::UdpIpv4,
            SocketAddr::V6(_) => TransportDomain::UdpIpv6,
        }
    }
}

impl Display for TransportDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportDomain::UdpIpv4 => write!(f, "udp/ipv4"),
            TransportDomain::UdpIpv6 => write!(f, "udp/ipv6"),
        }
    }
}

/// The identity of a protocol engine.
///
/// The carrier never looks inside it. It is used to attribute log lines and pending requests to an engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(String);

impl EngineId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Create a random engine identity, rendered as 12 bytes of hex.
    pub fn random() -> Self {
        let bytes: [u8; 12] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EngineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EngineId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
