//! The single task that owns the [`Dispatcher`].
//!
//! Everything that touches dispatcher state happens here, one event at a time. Each turn of the loop first routes
//! every received datagram that a transport scheduled on an earlier turn, then handles one of:
//!
//! - an I/O event from a bind, reader or writability task;
//! - a command from a [`DispatcherClient`](crate::DispatcherClient).
//!
//! When both are ready, the choice is random, so neither inbound traffic nor a busy client can starve the other.
//! Engine callbacks, completions and transport writes never run concurrently with each other.

use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::errors::DispatchError;
use crate::udp::{spawn_bind, spawn_reader, spawn_writable_watch, IoEvent, UdpSink};
use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use libcarrier::correlator::Completion;
use libcarrier::{
    Delivery, DomainKey, EngineId, InboundDatagram, ReconnectPolicy, RequestHandle, RequestOutcome, RoutingRule,
    Transport, TransportDomain, TransportState,
};
use log::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

type Reply<T> = oneshot::Sender<Result<T, DispatchError>>;

/// Instructions for the [`EventLoop`]. Each carries the sender half of a one-shot channel for the result.
pub enum DispatcherCommand {
    /// Register a UDP transport under `key` and start binding it. Executed via
    /// [`crate::DispatcherClient::open_udp_transport`].
    OpenUdpTransport { key: DomainKey, bind: SocketAddr, policy: ReconnectPolicy, sender: Reply<()> },
    /// Wait until the transport under `key` is bound, and return its local address.
    LocalAddr { key: DomainKey, sender: Reply<SocketAddr> },
    RegisterEngine { key: DomainKey, engine: Box<dyn Engine>, sender: Reply<()> },
    /// Returns the number of pending requests that were cancelled.
    UnregisterEngine { id: EngineId, sender: Reply<usize> },
    SetRoutingRule { rule: Box<dyn RoutingRule>, sender: oneshot::Sender<()> },
    SendMessage { key: DomainKey, destination: SocketAddr, payload: Vec<u8>, sender: Reply<Delivery> },
    SendRequest {
        engine: EngineId,
        destination: SocketAddr,
        payload: Vec<u8>,
        completion: Completion,
        sender: Reply<RequestHandle>,
    },
    Resolve { handle: RequestHandle, outcome: RequestOutcome, sender: Reply<()> },
    Cancel { handle: RequestHandle, sender: Reply<()> },
    TransportState { key: DomainKey, sender: oneshot::Sender<Option<TransportState>> },
    /// Close everything down. Returns the number of pending requests that were cancelled.
    Stop { sender: oneshot::Sender<usize> },
}

struct Endpoint {
    bind: SocketAddr,
    policy: ReconnectPolicy,
    local: Option<SocketAddr>,
    socket: Option<Arc<UdpSocket>>,
    /// The bind or reader task.
    task: Option<JoinHandle<()>>,
    writable: Option<JoinHandle<()>>,
    waiters: Vec<Reply<SocketAddr>>,
}

impl Endpoint {
    fn new(bind: SocketAddr, policy: ReconnectPolicy, task: JoinHandle<()>) -> Self {
        Self { bind, policy, local: None, socket: None, task: Some(task), writable: None, waiters: Vec::new() }
    }

    fn abort_tasks(&mut self) {
        for task in [self.task.take(), self.writable.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

pub struct EventLoop {
    dispatcher: Dispatcher<UdpSink>,
    inbound: mpsc::UnboundedReceiver<InboundDatagram>,
    commands: mpsc::Receiver<DispatcherCommand>,
    io_sender: mpsc::Sender<IoEvent>,
    io_events: mpsc::Receiver<IoEvent>,
    endpoints: HashMap<DomainKey, Endpoint>,
}

impl EventLoop {
    /// `io_buffer` bounds the I/O events that socket tasks may queue ahead of the loop.
    pub fn new(commands: mpsc::Receiver<DispatcherCommand>, io_buffer: usize) -> Self {
        let (dispatcher, inbound) = Dispatcher::new();
        let (io_sender, io_events) = mpsc::channel(io_buffer);
        Self { dispatcher, inbound, commands, io_sender, io_events, endpoints: HashMap::new() }
    }

    /// Run until a `Stop` command arrives, or every client handle has been dropped.
    pub async fn run(mut self) {
        info!("Dispatcher event loop started");
        loop {
            self.route_scheduled();
            self.watch_backlogs();
            tokio::select! {
                Some(event) = self.io_events.next() => self.handle_io_event(event),
                command = self.commands.next() => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
            }
        }
        info!("Dispatcher event loop finished");
    }

    /// Datagrams scheduled on an earlier turn are routed before anything new is taken on.
    fn route_scheduled(&mut self) {
        while let Ok(Some(datagram)) = self.inbound.try_next() {
            self.dispatcher.route_inbound(datagram);
        }
    }

    /// Start waiting for writability on every socket with writes held back by a full send buffer.
    fn watch_backlogs(&mut self) {
        for key in self.dispatcher.backlogged() {
            let Some(endpoint) = self.endpoints.get_mut(key) else {
                continue;
            };
            if endpoint.writable.is_some() {
                continue;
            }
            let Some(socket) = endpoint.socket.clone() else {
                continue;
            };
            trace!("[{key}] send buffer full. Waiting for the socket to drain.");
            endpoint.writable = Some(spawn_writable_watch(key.clone(), socket, self.io_sender.clone()));
        }
    }

    /// Returns false once the loop should finish.
    fn handle_command(&mut self, command: Option<DispatcherCommand>) -> bool {
        let Some(command) = command else {
            debug!("All dispatcher clients dropped");
            self.shutdown();
            return false;
        };
        match command {
            DispatcherCommand::OpenUdpTransport { key, bind, policy, sender } => {
                let _ = sender.send(self.open_udp_transport(key, bind, policy));
            }
            DispatcherCommand::LocalAddr { key, sender } => match self.endpoints.get_mut(&key) {
                None => {
                    let _ = sender.send(Err(DispatchError::UnknownDomain(key)));
                }
                Some(endpoint) => match endpoint.local {
                    Some(addr) => {
                        let _ = sender.send(Ok(addr));
                    }
                    None if self.dispatcher.transport_state(&key) == Some(TransportState::Closed) => {
                        let _ = sender.send(Err(libcarrier::TransportError::Closed.into()));
                    }
                    None => endpoint.waiters.push(sender),
                },
            },
            DispatcherCommand::RegisterEngine { key, engine, sender } => {
                let _ = sender.send(self.dispatcher.register_engine(key, engine));
            }
            DispatcherCommand::UnregisterEngine { id, sender } => {
                let result = self.dispatcher.unregister_engine(&id).map(|(_, cancelled)| cancelled);
                let _ = sender.send(result);
            }
            DispatcherCommand::SetRoutingRule { rule, sender } => {
                self.dispatcher.set_routing_rule(rule);
                let _ = sender.send(());
            }
            DispatcherCommand::SendMessage { key, destination, payload, sender } => {
                let _ = sender.send(self.dispatcher.send_message(&key, payload, destination));
            }
            DispatcherCommand::SendRequest { engine, destination, payload, completion, sender } => {
                let _ = sender.send(self.dispatcher.submit(&engine, destination, payload, completion));
            }
            DispatcherCommand::Resolve { handle, outcome, sender } => {
                let _ = sender.send(self.dispatcher.resolve(handle, outcome));
            }
            DispatcherCommand::Cancel { handle, sender } => {
                let _ = sender.send(self.dispatcher.cancel(handle));
            }
            DispatcherCommand::TransportState { key, sender } => {
                let _ = sender.send(self.dispatcher.transport_state(&key));
            }
            DispatcherCommand::Stop { sender } => {
                let _ = sender.send(self.shutdown());
                return false;
            }
        }
        true
    }

    fn open_udp_transport(
        &mut self,
        key: DomainKey,
        bind: SocketAddr,
        policy: ReconnectPolicy,
    ) -> Result<(), DispatchError> {
        let transport = Transport::new(key.clone(), TransportDomain::for_address(&bind));
        self.dispatcher.register_transport(key.clone(), transport)?;
        let task = spawn_bind(key.clone(), bind, self.io_sender.clone());
        self.endpoints.insert(key, Endpoint::new(bind, policy, task));
        Ok(())
    }

    fn handle_io_event(&mut self, event: IoEvent) {
        if self.dispatcher.is_stopped() {
            trace!("Dispatcher stopped. Ignoring I/O event for {}", event.key());
            return;
        }
        match event {
            IoEvent::Bound { key, socket } => {
                let Some(endpoint) = self.endpoints.get_mut(&key) else {
                    warn!("Socket bound for unknown transport {key}");
                    return;
                };
                let local = match socket.local_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        error!("[{key}] bound socket has no local address. {e}");
                        endpoint.bind
                    }
                };
                info!("[{key}] listening on {local}");
                endpoint.local = Some(local);
                endpoint.socket = Some(socket.clone());
                for waiter in endpoint.waiters.drain(..) {
                    let _ = waiter.send(Ok(local));
                }
                endpoint.task = Some(spawn_reader(key.clone(), socket.clone(), self.io_sender.clone()));
                if let Err(e) = self.dispatcher.connection_established(&key, UdpSink::new(socket)) {
                    warn!("[{key}] could not use the new socket. {e}");
                }
            }
            IoEvent::BindFailed { key, error } => {
                error!("[{key}] could not bind. {error}");
                if let Some(endpoint) = self.endpoints.get_mut(&key) {
                    endpoint.task = None;
                    for waiter in endpoint.waiters.drain(..) {
                        let e = std::io::Error::new(error.kind(), error.to_string());
                        let _ = waiter.send(Err(e.into()));
                    }
                }
                // Nothing was ever sent, so there is nothing to rearm.
                if let Err(e) = self.dispatcher.connection_lost(&key, ReconnectPolicy::Close) {
                    warn!("[{key}] {e}");
                }
            }
            IoEvent::Datagram { key, source, payload } => self.dispatcher.datagram_received(&key, payload, source),
            IoEvent::ReadFailed { key, error } => {
                warn!("[{key}] socket failed. {error}");
                let Some(endpoint) = self.endpoints.get_mut(&key) else {
                    return;
                };
                let policy = endpoint.policy;
                endpoint.abort_tasks();
                endpoint.socket = None;
                // Rebind to the same port the peers already know, if we had one.
                let rebind = endpoint.local.take().unwrap_or(endpoint.bind);
                if let Err(e) = self.dispatcher.connection_lost(&key, policy) {
                    warn!("[{key}] {e}");
                }
                endpoint.task = match policy {
                    ReconnectPolicy::Rearm => Some(spawn_bind(key, rebind, self.io_sender.clone())),
                    ReconnectPolicy::Close => None,
                };
            }
            IoEvent::Writable { key } => {
                if let Some(endpoint) = self.endpoints.get_mut(&key) {
                    endpoint.writable = None;
                }
                if let Err(e) = self.dispatcher.flush(&key) {
                    warn!("[{key}] {e}");
                }
            }
        }
    }

    fn shutdown(&mut self) -> usize {
        for (key, endpoint) in self.endpoints.iter_mut() {
            trace!("[{key}] stopping socket tasks");
            endpoint.abort_tasks();
            for waiter in endpoint.waiters.drain(..) {
                let _ = waiter.send(Err(DispatchError::Stopped));
            }
        }
        self.dispatcher.stop()
    }
}
