use crate::correlator::RequestHandle;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("The transport is closed and cannot accept any more writes.")]
    Closed,
    #[error("A datagram was received, but no receiver is configured on the transport.")]
    NoReceiverConfigured,
    #[error("Sending the datagram to {destination} failed. {source}")]
    SendFailure {
        destination: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Raised when a handle is resolved or cancelled that is not pending. This is a bug in the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("Request {0} is not pending. It was never registered or has already been resolved.")]
pub struct UnknownHandleError(pub RequestHandle);
