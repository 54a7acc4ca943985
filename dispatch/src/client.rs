use crate::engine::Engine;
use crate::errors::DispatchError;
use crate::event_loop::{DispatcherCommand, EventLoop};
use futures::channel::{mpsc, oneshot};
use futures::SinkExt;
use libcarrier::correlator::Completion;
use libcarrier::{
    Delivery, DomainKey, EngineId, ReconnectPolicy, RequestHandle, RequestOutcome, RoutingRule, TransportState,
};
use std::net::SocketAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// How many commands may be buffered per client handle before senders wait for the loop.
    pub command_buffer: usize,
    /// How many socket events may queue up before readers wait for the loop.
    pub io_event_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { command_buffer: 32, io_event_buffer: 256 }
    }
}

/// Creates the dispatcher components, namely:
///
/// - The [`DispatcherClient`] to interact with the event loop from anywhere within your application.
/// - The [`EventLoop`] itself, which must be spawned (or awaited) for anything to happen.
///
/// Each call creates an independent dispatcher.
pub fn new_dispatcher(config: DispatcherConfig) -> (DispatcherClient, EventLoop) {
    let (sender, receiver) = mpsc::channel(config.command_buffer);
    (DispatcherClient { sender }, EventLoop::new(receiver, config.io_event_buffer))
}

/// A sender interface to the dispatcher event loop. It can be cheaply cloned and shared among tasks.
///
/// Every method follows the same pattern: a one-shot channel is created, a [`DispatcherCommand`] carrying the sender
/// half is sent to the [`EventLoop`], and the method waits for the reply. The client itself does no work.
#[derive(Clone)]
pub struct DispatcherClient {
    sender: mpsc::Sender<DispatcherCommand>,
}

impl DispatcherClient {
    /// Register a UDP transport under `key` and bind it to `bind`.
    ///
    /// Returns as soon as the transport is registered. Binding completes later; anything sent in the meantime is
    /// queued. Lost sockets close the transport.
    pub async fn open_udp_transport(&mut self, key: DomainKey, bind: SocketAddr) -> Result<(), DispatchError> {
        self.open_udp_transport_with_policy(key, bind, ReconnectPolicy::Close).await
    }

    pub async fn open_udp_transport_with_policy(
        &mut self,
        key: DomainKey,
        bind: SocketAddr,
        policy: ReconnectPolicy,
    ) -> Result<(), DispatchError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::OpenUdpTransport { key, bind, policy, sender }).await?;
        receiver.await?
    }

    /// The address the transport under `key` is bound to. Waits for the bind to complete.
    pub async fn local_addr(&mut self, key: DomainKey) -> Result<SocketAddr, DispatchError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::LocalAddr { key, sender }).await?;
        receiver.await?
    }

    pub async fn register_engine<E>(&mut self, key: DomainKey, engine: E) -> Result<(), DispatchError>
    where
        E: Engine + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::RegisterEngine { key, engine: Box::new(engine), sender }).await?;
        receiver.await?
    }

    /// Remove an engine. Returns the number of its pending requests that were cancelled.
    pub async fn unregister_engine(&mut self, id: EngineId) -> Result<usize, DispatchError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::UnregisterEngine { id, sender }).await?;
        receiver.await?
    }

    pub async fn set_routing_rule<R>(&mut self, rule: R) -> Result<(), DispatchError>
    where
        R: RoutingRule + 'static,
    {
        self.set_boxed_routing_rule(Box::new(rule)).await
    }

    pub async fn set_boxed_routing_rule(&mut self, rule: Box<dyn RoutingRule>) -> Result<(), DispatchError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::SetRoutingRule { rule, sender }).await?;
        receiver.await?;
        Ok(())
    }

    /// Send an uncorrelated datagram on the transport registered under `key`.
    pub async fn send_message(
        &mut self,
        key: DomainKey,
        payload: Vec<u8>,
        destination: SocketAddr,
    ) -> Result<Delivery, DispatchError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::SendMessage { key, destination, payload, sender }).await?;
        receiver.await?
    }

    /// Send a request on behalf of `engine`. The outcome arrives on the returned receiver.
    ///
    /// The receiver always yields exactly one outcome, unless the event loop dies before the request completes.
    pub async fn send_request(
        &mut self,
        engine: EngineId,
        destination: SocketAddr,
        payload: Vec<u8>,
    ) -> Result<(RequestHandle, oneshot::Receiver<RequestOutcome>), DispatchError> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let handle = self
            .send_request_with_callback(engine, destination, payload, move |outcome| {
                let _ = outcome_tx.send(outcome);
            })
            .await?;
        Ok((handle, outcome_rx))
    }

    /// Send a request on behalf of `engine`. `on_complete` runs on the event loop, exactly once.
    pub async fn send_request_with_callback<F>(
        &mut self,
        engine: EngineId,
        destination: SocketAddr,
        payload: Vec<u8>,
        on_complete: F,
    ) -> Result<RequestHandle, DispatchError>
    where
        F: FnOnce(RequestOutcome) + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let completion: Completion = Box::new(on_complete);
        self.sender.send(DispatcherCommand::SendRequest { engine, destination, payload, completion, sender }).await?;
        receiver.await?
    }

    pub async fn resolve(&mut self, handle: RequestHandle, outcome: RequestOutcome) -> Result<(), DispatchError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::Resolve { handle, outcome, sender }).await?;
        receiver.await?
    }

    /// Withdraw a pending request. Its completion never runs.
    pub async fn cancel(&mut self, handle: RequestHandle) -> Result<(), DispatchError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::Cancel { handle, sender }).await?;
        receiver.await?
    }

    pub async fn transport_state(&mut self, key: DomainKey) -> Result<Option<TransportState>, DispatchError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::TransportState { key, sender }).await?;
        Ok(receiver.await?)
    }

    /// Close every transport, cancel every pending request and end the event loop.
    ///
    /// Returns the number of requests that were cancelled.
    pub async fn stop(mut self) -> Result<usize, DispatchError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(DispatcherCommand::Stop { sender }).await?;
        Ok(receiver.await?)
    }
}
