pub mod correlator;
pub mod domain;
pub mod error;
pub mod routing;
pub mod transport;

pub use correlator::{ErrorIndication, RequestCorrelator, RequestHandle, RequestOutcome, VarBind};
pub use domain::{DomainKey, EngineId, TransportDomain};
pub use error::{TransportError, UnknownHandleError};
pub use routing::{PortModulus, RoutingRule, SoleKey};
pub use transport::{
    DatagramSink, Delivery, FailedWrite, InboundDatagram, PendingWrite, ReconnectPolicy, Transport, TransportHandle,
    TransportState,
};
