//! Shares UDP transports between several protocol engines.
//!
//! The main entry point is [`new_dispatcher`], which returns a [`DispatcherClient`] and the [`EventLoop`] that does the
//! actual work. Spawn the loop, open transports and register engines through the client, then send requests on
//! behalf of any engine. Inbound datagrams are routed to engines by the configured
//! [`RoutingRule`](libcarrier::RoutingRule).

mod client;
pub mod dispatcher;
pub mod engine;
mod errors;
mod event_loop;
mod originator;
pub mod target;
pub mod udp;

pub use client::{new_dispatcher, DispatcherClient, DispatcherConfig};
pub use dispatcher::Dispatcher;
pub use engine::{EchoEngine, Engine, EngineContext, PeerAckEngine};
pub use errors::DispatchError;
pub use event_loop::{DispatcherCommand, EventLoop};
pub use originator::NotificationOriginator;
pub use target::{AuthData, TargetEntry, TransportTarget, UsmUserData};
