use futures::channel::{mpsc, oneshot};
use libcarrier::{DomainKey, EngineId, TransportError, UnknownHandleError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("A transport is already registered under the domain key {0}.")]
    DuplicateRegistration(DomainKey),
    #[error("No transport is registered under the domain key {0}.")]
    UnknownDomain(DomainKey),
    #[error("No engine with id {0} is registered.")]
    UnknownEngine(EngineId),
    #[error("The dispatcher has been stopped.")]
    Stopped,
    #[error("Transport error. {0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    UnknownHandle(#[from] UnknownHandleError),
    #[error("Could not resolve the target address {0}.")]
    AddressResolution(String),
    #[error("I/O error. {0}")]
    Io(#[from] std::io::Error),
    #[error("The dispatcher event loop is not running.")]
    LoopGone,
}

impl From<mpsc::SendError> for DispatchError {
    fn from(_: mpsc::SendError) -> Self {
        DispatchError::LoopGone
    }
}

impl From<oneshot::Canceled> for DispatchError {
    fn from(_: oneshot::Canceled) -> Self {
        DispatchError::LoopGone
    }
}
