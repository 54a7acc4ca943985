use libcarrier::{DomainKey, EngineId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid configuration file: {0}")]
    InvalidConfig(#[from] serde_yml::Error),
    #[error("The port modulus must not be zero.")]
    ZeroModulus,
    #[error("Engine {0} uses domain key {1}, but no transport is configured for it.")]
    MissingTransport(EngineId, DomainKey),
    #[error("Domain key {0} is configured for more than one transport.")]
    DuplicateTransport(DomainKey),
}
