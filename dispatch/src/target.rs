//! Where notifications go, and the security parameters they are sent with.
//!
//! The dispatcher treats security parameters as opaque: they are handed to the engine's encoder untouched and only
//! show up here so that targets can be configured and logged. The transport target is resolved to a socket address
//! just before sending.

use crate::errors::DispatchError;
use log::*;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;
use zeroize::Zeroize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum AuthData {
    Community { community: String },
    Usm(UsmUserData),
}

impl AuthData {
    pub fn community<S: Into<String>>(community: S) -> Self {
        AuthData::Community { community: community.into() }
    }

    /// The name the credentials are known by. Safe to log.
    pub fn security_name(&self) -> &str {
        match self {
            AuthData::Community { .. } => "community",
            AuthData::Usm(usm) => &usm.user,
        }
    }
}

/// User-based security credentials. The keys are wiped from memory when the value is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsmUserData {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priv_key: Option<String>,
}

impl UsmUserData {
    pub fn new<S: Into<String>>(user: S, auth_key: Option<String>, priv_key: Option<String>) -> Self {
        Self { user: user.into(), auth_key, priv_key }
    }
}

impl Debug for UsmUserData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let redact = |k: &Option<String>| k.as_ref().map(|_| "***");
        f.debug_struct("UsmUserData")
            .field("user", &self.user)
            .field("auth_key", &redact(&self.auth_key))
            .field("priv_key", &redact(&self.priv_key))
            .finish()
    }
}

impl Zeroize for UsmUserData {
    fn zeroize(&mut self) {
        self.auth_key.zeroize();
        self.priv_key.zeroize();
    }
}

impl Drop for UsmUserData {
    fn drop(&mut self) {
        self.zeroize();
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportTarget {
    pub host: String,
    pub port: u16,
    /// How long to wait for a reply before the request fails with a timeout. No timeout if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TransportTarget {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self { host: host.into(), port, timeout_ms: None }
    }

    /// Timeouts too long for `timeout_ms` are capped at `u64::MAX` milliseconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(millis(timeout));
        self
    }

    /// Use `timeout` unless the target sets its own.
    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.timeout_ms.get_or_insert_with(|| millis(timeout));
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the host name. The first address returned by the resolver wins.
    pub async fn resolve(&self) -> Result<SocketAddr, DispatchError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| DispatchError::AddressResolution(format!("{}. {e}", self.address())))?;
        let addr = addrs.next().ok_or_else(|| DispatchError::AddressResolution(self.address()))?;
        trace!("Resolved {} to {addr}", self.address());
        Ok(addr)
    }
}

impl Display for TransportTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "udp://{}", self.address())
    }
}

/// One configured destination: the credentials to use, and where to send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub auth: AuthData,
    pub transport: TransportTarget,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
