//! The registry that ties transports, engines and the routing rule together.
//!
//! [`Dispatcher`] is the synchronous heart of the carrier. It owns every [`Transport`] (one per [`DomainKey`]), the
//! engines associated with each key, the [`RoutingRule`] and the [`RequestCorrelator`]. It performs no I/O of its
//! own: the [`EventLoop`](crate::EventLoop) feeds it connection and datagram events, and it pushes writes into
//! the transports' sinks.
//!
//! Inbound datagrams take two turns of the loop. The I/O event is handed to the receiving transport, which
//! schedules an [`InboundDatagram`]; on a later turn, [`Dispatcher::route_inbound`] applies the routing rule and
//! calls the selected engines.

use crate::engine::{Engine, EngineContext};
use crate::errors::DispatchError;
use futures::channel::mpsc;
use libcarrier::correlator::Completion;
use libcarrier::{
    DatagramSink, Delivery, DomainKey, EngineId, ErrorIndication, FailedWrite, InboundDatagram, PendingWrite,
    ReconnectPolicy, RequestCorrelator, RequestHandle, RequestOutcome, RoutingRule, SoleKey, Transport,
    TransportError, TransportState,
};
use log::*;
use std::collections::HashMap;
use std::net::SocketAddr;

pub struct Dispatcher<S> {
    transports: HashMap<DomainKey, Transport<S>>,
    engines: HashMap<DomainKey, Vec<Box<dyn Engine>>>,
    engine_keys: HashMap<EngineId, DomainKey>,
    rule: Box<dyn RoutingRule>,
    correlator: RequestCorrelator,
    inbound_tx: mpsc::UnboundedSender<InboundDatagram>,
    stopped: bool,
}

impl<S: DatagramSink> Dispatcher<S> {
    /// Create a dispatcher, and the queue on which its transports schedule received datagrams.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InboundDatagram>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        let dispatcher = Self {
            transports: HashMap::new(),
            engines: HashMap::new(),
            engine_keys: HashMap::new(),
            rule: Box::new(SoleKey::default()),
            correlator: RequestCorrelator::new(),
            inbound_tx,
            stopped: false,
        };
        (dispatcher, inbound_rx)
    }

    pub fn register_transport(&mut self, key: DomainKey, mut transport: Transport<S>) -> Result<(), DispatchError> {
        self.check_running()?;
        if self.transports.contains_key(&key) {
            return Err(DispatchError::DuplicateRegistration(key));
        }
        transport.set_receiver(self.inbound_tx.clone());
        info!("Transport registered under {key} ({})", transport.domain());
        self.transports.insert(key, transport);
        Ok(())
    }

    /// Associate `engine` with `key`. An engine registered again, under any key, replaces its earlier registration.
    pub fn register_engine(&mut self, key: DomainKey, engine: Box<dyn Engine>) -> Result<(), DispatchError> {
        self.check_running()?;
        if !self.transports.contains_key(&key) {
            return Err(DispatchError::UnknownDomain(key));
        }
        let id = engine.id().clone();
        if let Some(previous) = self.detach_engine(&id) {
            debug!("Engine {id} moves from {} to {key}", previous.0);
        }
        info!("Engine {id} registered under {key}");
        self.engines.entry(key.clone()).or_default().push(engine);
        self.engine_keys.insert(id, key);
        Ok(())
    }

    /// Remove an engine. Its pending requests are resolved as cancelled.
    pub fn unregister_engine(&mut self, id: &EngineId) -> Result<(Box<dyn Engine>, usize), DispatchError> {
        let (key, engine) = self.detach_engine(id).ok_or_else(|| DispatchError::UnknownEngine(id.clone()))?;
        let cancelled = self.correlator.cancel_engine(id);
        info!("Engine {id} unregistered from {key}. {cancelled} pending requests cancelled.");
        Ok((engine, cancelled))
    }

    pub fn set_routing_rule(&mut self, rule: Box<dyn RoutingRule>) {
        self.rule = rule;
    }

    pub fn transport_state(&self, key: &DomainKey) -> Option<TransportState> {
        self.transports.get(key).map(Transport::state)
    }

    pub fn engine_key(&self, id: &EngineId) -> Option<&DomainKey> {
        self.engine_keys.get(id)
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Send an uncorrelated datagram on the transport registered under `key`.
    pub fn send_message(
        &mut self,
        key: &DomainKey,
        payload: Vec<u8>,
        destination: SocketAddr,
    ) -> Result<Delivery, DispatchError> {
        let transport = self.transports.get_mut(key).ok_or_else(|| DispatchError::UnknownDomain(key.clone()))?;
        Ok(transport.send_message(payload, destination)?)
    }

    /// Send a request on behalf of `engine` and correlate its outcome.
    ///
    /// The handle is minted before the write is attempted. From then on, every failure is delivered to
    /// `completion` as an error indication rather than returned here.
    pub fn submit(
        &mut self,
        engine: &EngineId,
        destination: SocketAddr,
        payload: Vec<u8>,
        completion: Completion,
    ) -> Result<RequestHandle, DispatchError> {
        self.check_running()?;
        let key = self.engine_keys.get(engine).cloned().ok_or_else(|| DispatchError::UnknownEngine(engine.clone()))?;
        let transport = self.transports.get_mut(&key).ok_or_else(|| DispatchError::UnknownDomain(key.clone()))?;
        let handle = self.correlator.register_completion(engine.clone(), completion);
        match transport.write(PendingWrite::correlated(payload, destination, handle)) {
            Ok(delivery) => {
                debug!("Request {handle} from engine {engine} to {destination}: {delivery:?}");
                if let Some(e) = self.engines.get_mut(&key).and_then(|list| list.iter_mut().find(|e| e.id() == engine)) {
                    e.on_request_sent(handle, destination);
                }
            }
            Err(error) => self.fail_request(handle, &error),
        }
        Ok(handle)
    }

    pub fn resolve(&mut self, handle: RequestHandle, outcome: RequestOutcome) -> Result<(), DispatchError> {
        let engine = self.correlator.engine_of(handle).cloned();
        self.correlator.resolve(handle, outcome)?;
        if let Some(engine) = engine {
            self.notify_finished(&engine, handle);
        }
        Ok(())
    }

    /// Withdraw a pending request. Its completion is dropped without being called.
    pub fn cancel(&mut self, handle: RequestHandle) -> Result<(), DispatchError> {
        let engine = self.correlator.cancel(handle)?;
        self.notify_finished(&engine, handle);
        Ok(())
    }

    /// The endpoint behind `key` is ready: flush its queue.
    pub fn connection_established(&mut self, key: &DomainKey, sink: S) -> Result<(), DispatchError> {
        let transport = self.transports.get_mut(key).ok_or_else(|| DispatchError::UnknownDomain(key.clone()))?;
        let failures = transport.on_connection_established(sink)?;
        self.report_failures(failures);
        Ok(())
    }

    /// Retry the writes queued behind a full send buffer on `key`.
    pub fn flush(&mut self, key: &DomainKey) -> Result<(), DispatchError> {
        let transport = self.transports.get_mut(key).ok_or_else(|| DispatchError::UnknownDomain(key.clone()))?;
        let failures = transport.flush();
        self.report_failures(failures);
        Ok(())
    }

    /// The keys of connected transports with writes waiting for the socket to become writable.
    pub fn backlogged(&self) -> impl Iterator<Item = &DomainKey> + '_ {
        self.transports.iter().filter(|(_, t)| t.is_backlogged()).map(|(key, _)| key)
    }

    pub fn connection_lost(&mut self, key: &DomainKey, policy: ReconnectPolicy) -> Result<(), DispatchError> {
        let transport = self.transports.get_mut(key).ok_or_else(|| DispatchError::UnknownDomain(key.clone()))?;
        let failures = transport.on_connection_lost(policy);
        self.report_failures(failures);
        Ok(())
    }

    /// A datagram arrived on the endpoint behind `key`. Routing happens when the scheduled datagram is drained.
    pub fn datagram_received(&mut self, key: &DomainKey, payload: Vec<u8>, source: SocketAddr) {
        let Some(transport) = self.transports.get(key) else {
            warn!("Datagram from {source} arrived on unregistered transport {key}. Dropped.");
            return;
        };
        if let Err(e) = transport.on_datagram_received(payload, source) {
            warn!("Datagram from {source} on {key} dropped. {e}");
        }
    }

    /// Route a scheduled datagram to the engines of the selected domain key.
    pub fn route_inbound(&mut self, datagram: InboundDatagram) {
        if self.stopped {
            trace!("Dispatcher stopped. Dropping datagram from {}", datagram.source);
            return;
        }
        let InboundDatagram { key: received_on, domain, source, payload } = datagram;
        let key = self.rule.route(domain, &source, &payload);
        let Some(transport) = self.transports.get_mut(&key) else {
            warn!("Routing sent a datagram from {source} (received on {received_on}) to unregistered key {key}. Dropped.");
            return;
        };
        let Some(engines) = self.engines.get_mut(&key).filter(|list| !list.is_empty()) else {
            warn!("No engine registered under {key} for the datagram from {source}. Dropped.");
            return;
        };
        trace!("Routing {} bytes from {source} (received on {received_on}) to {key}", payload.len());
        for engine in engines.iter_mut() {
            let mut ctx = EngineContext::new(&mut *transport, &mut self.correlator);
            engine.on_datagram(&mut ctx, source, &payload);
        }
    }

    /// Close every transport and cancel every pending request. Later registrations are refused.
    ///
    /// Returns the number of requests that were cancelled. Stopping twice is a no-op.
    pub fn stop(&mut self) -> usize {
        if self.stopped {
            return 0;
        }
        self.stopped = true;
        for (key, transport) in self.transports.iter_mut() {
            if let Some(undelivered) = transport.close() {
                if !undelivered.is_empty() {
                    warn!("Transport {key} closed with {} writes never sent", undelivered.len());
                }
            }
        }
        let cancelled = self.correlator.cancel_all();
        info!("Dispatcher stopped. {cancelled} pending requests cancelled.");
        cancelled
    }

    fn check_running(&self) -> Result<(), DispatchError> {
        if self.stopped {
            Err(DispatchError::Stopped)
        } else {
            Ok(())
        }
    }

    fn detach_engine(&mut self, id: &EngineId) -> Option<(DomainKey, Box<dyn Engine>)> {
        let key = self.engine_keys.remove(id)?;
        let list = self.engines.get_mut(&key)?;
        let pos = list.iter().position(|e| e.id() == id)?;
        let engine = list.remove(pos);
        Some((key, engine))
    }

    fn report_failures(&mut self, failures: Vec<FailedWrite>) {
        for FailedWrite { write, error } in failures {
            match write.handle {
                Some(handle) => self.fail_request(handle, &error),
                None => warn!("Datagram to {} was not delivered. {error}", write.destination),
            }
        }
    }

    fn fail_request(&mut self, handle: RequestHandle, error: &TransportError) {
        let indication = match error {
            TransportError::Closed => ErrorIndication::TransportClosed,
            other => ErrorIndication::SendFailed(other.to_string()),
        };
        if let Err(e) = self.resolve(handle, indication.into()) {
            debug!("Send failure for request {handle} not delivered. {e}");
        }
    }

    fn notify_finished(&mut self, engine: &EngineId, handle: RequestHandle) {
        let Some(key) = self.engine_keys.get(engine) else {
            return;
        };
        if let Some(e) = self.engines.get_mut(key).and_then(|list| list.iter_mut().find(|e| e.id() == engine)) {
            e.on_request_finished(handle);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::{EchoEngine, PeerAckEngine};
    use futures::StreamExt;
    use libcarrier::routing::PortModulus;
    use libcarrier::TransportDomain;
    use std::num::NonZeroU16;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
        unreachable: Vec<u16>,
        stalled: Arc<AtomicUsize>,
    }

    impl DatagramSink for RecordingSink {
        fn send_to(&mut self, payload: &[u8], destination: SocketAddr) -> std::io::Result<()> {
            if self.stalled.load(Ordering::SeqCst) > 0 {
                self.stalled.fetch_sub(1, Ordering::SeqCst);
                return Err(std::io::ErrorKind::WouldBlock.into());
            }
            if self.unreachable.contains(&destination.port()) {
                return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "unreachable"));
            }
            self.sent.lock().unwrap().push((payload.to_vec(), destination));
            Ok(())
        }
    }

    /// Records the datagrams it is handed.
    struct Recorder {
        id: EngineId,
        seen: Arc<Mutex<Vec<(DomainKey, SocketAddr, Vec<u8>)>>>,
    }

    impl Engine for Recorder {
        fn id(&self) -> &EngineId {
            &self.id
        }

        fn on_datagram(&mut self, ctx: &mut EngineContext<'_>, source: SocketAddr, payload: &[u8]) {
            self.seen.lock().unwrap().push((ctx.key().clone(), source, payload.to_vec()));
        }
    }

    type Seen = Arc<Mutex<Vec<(DomainKey, SocketAddr, Vec<u8>)>>>;

    /// Records the requests the dispatcher reports as finished.
    struct FinishTracker {
        id: EngineId,
        finished: Arc<Mutex<Vec<RequestHandle>>>,
    }

    impl Engine for FinishTracker {
        fn id(&self) -> &EngineId {
            &self.id
        }

        fn on_datagram(&mut self, _ctx: &mut EngineContext<'_>, _source: SocketAddr, _payload: &[u8]) {}

        fn on_request_finished(&mut self, handle: RequestHandle) {
            self.finished.lock().unwrap().push(handle);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn key(k: &str) -> DomainKey {
        DomainKey::from(k)
    }

    fn transport(k: &str) -> Transport<RecordingSink> {
        Transport::new(key(k), TransportDomain::UdpIpv4)
    }

    fn outcome_log() -> (Arc<Mutex<Vec<RequestOutcome>>>, impl Fn() -> Completion) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let factory = move || -> Completion {
            let l = Arc::clone(&l);
            Box::new(move |outcome| l.lock().unwrap().push(outcome))
        };
        (log, factory)
    }

    /// Two transports, A and B, each with a recording engine, routed on `port % 3`.
    fn two_engine_dispatcher() -> (Dispatcher<RecordingSink>, mpsc::UnboundedReceiver<InboundDatagram>, Seen, Seen) {
        let (mut dispatcher, inbound) = Dispatcher::new();
        dispatcher.register_transport(key("A"), transport("A")).unwrap();
        dispatcher.register_transport(key("B"), transport("B")).unwrap();
        let seen_a = Seen::default();
        let seen_b = Seen::default();
        dispatcher.register_engine(key("A"), Box::new(Recorder { id: "engine-a".into(), seen: seen_a.clone() })).unwrap();
        dispatcher.register_engine(key("B"), Box::new(Recorder { id: "engine-b".into(), seen: seen_b.clone() })).unwrap();
        dispatcher.set_routing_rule(Box::new(PortModulus::new(NonZeroU16::new(3).unwrap(), "A", "B")));
        (dispatcher, inbound, seen_a, seen_b)
    }

    fn drain(dispatcher: &mut Dispatcher<RecordingSink>, inbound: &mut mpsc::UnboundedReceiver<InboundDatagram>) {
        while let Ok(Some(datagram)) = inbound.try_next() {
            dispatcher.route_inbound(datagram);
        }
    }

    #[test]
    fn duplicate_transport_registration_fails() {
        let (mut dispatcher, _inbound) = Dispatcher::<RecordingSink>::new();
        dispatcher.register_transport(key("A"), transport("A")).unwrap();
        let sink = RecordingSink::default();
        dispatcher.connection_established(&key("A"), sink.clone()).unwrap();
        let err = dispatcher.register_transport(key("A"), transport("A")).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateRegistration(k) if k == key("A")));
        // The first registration is intact
        assert_eq!(dispatcher.transport_state(&key("A")), Some(TransportState::Connected));
        dispatcher.send_message(&key("A"), b"still here".to_vec(), addr(162)).unwrap();
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn engines_need_a_registered_domain() {
        let (mut dispatcher, _inbound) = Dispatcher::<RecordingSink>::new();
        let err = dispatcher.register_engine(key("A"), Box::new(EchoEngine::new("e".into()))).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownDomain(_)));
        let err = dispatcher.send_message(&key("A"), vec![], addr(1)).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownDomain(_)));
    }

    #[test]
    fn re_registering_an_engine_moves_it() {
        let (mut dispatcher, _inbound) = Dispatcher::<RecordingSink>::new();
        dispatcher.register_transport(key("A"), transport("A")).unwrap();
        dispatcher.register_transport(key("B"), transport("B")).unwrap();
        dispatcher.register_engine(key("A"), Box::new(EchoEngine::new("e".into()))).unwrap();
        dispatcher.register_engine(key("B"), Box::new(EchoEngine::new("e".into()))).unwrap();
        assert_eq!(dispatcher.engine_key(&"e".into()), Some(&key("B")));
        assert!(dispatcher.engines.get(&key("A")).unwrap().is_empty());
        assert_eq!(dispatcher.engines.get(&key("B")).unwrap().len(), 1);
    }

    #[test]
    fn inbound_datagrams_follow_the_routing_rule() {
        env_logger::try_init().ok();
        let (mut dispatcher, mut inbound, seen_a, seen_b) = two_engine_dispatcher();
        // Everything arrives on A's socket, but routing decides.
        dispatcher.datagram_received(&key("A"), b"from-162".to_vec(), addr(162));
        dispatcher.datagram_received(&key("A"), b"from-1162".to_vec(), addr(1162));
        dispatcher.datagram_received(&key("B"), b"again-162".to_vec(), addr(162));
        drain(&mut dispatcher, &mut inbound);
        let a = seen_a.lock().unwrap();
        let b = seen_b.lock().unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0], (key("A"), addr(162), b"from-162".to_vec()));
        assert_eq!(a[1].2, b"again-162".to_vec());
        assert_eq!(*b, vec![(key("B"), addr(1162), b"from-1162".to_vec())]);
    }

    #[test]
    fn unregistered_routing_target_is_dropped() {
        let (mut dispatcher, mut inbound, seen_a, seen_b) = two_engine_dispatcher();
        dispatcher.set_routing_rule(Box::new(SoleKey::new("nowhere")));
        dispatcher.datagram_received(&key("A"), b"lost".to_vec(), addr(162));
        drain(&mut dispatcher, &mut inbound);
        assert!(seen_a.lock().unwrap().is_empty());
        assert!(seen_b.lock().unwrap().is_empty());
    }

    #[test]
    fn queued_notification_is_sent_once_in_order() {
        let (mut dispatcher, _inbound, _, _) = two_engine_dispatcher();
        let (outcomes, completion) = outcome_log();
        dispatcher.send_message(&key("A"), b"first".to_vec(), addr(10)).unwrap();
        let handle = dispatcher.submit(&"engine-a".into(), addr(162), b"inform".to_vec(), completion()).unwrap();
        dispatcher.send_message(&key("A"), b"last".to_vec(), addr(11)).unwrap();
        assert_eq!(dispatcher.transport_state(&key("A")), Some(TransportState::Unconnected));

        let sink = RecordingSink::default();
        dispatcher.connection_established(&key("A"), sink.clone()).unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![(b"first".to_vec(), addr(10)), (b"inform".to_vec(), addr(162)), (b"last".to_vec(), addr(11))]
        );
        assert_eq!(sent.iter().filter(|(_, dest)| *dest == addr(162)).count(), 1);
        assert!(dispatcher.correlator().is_pending(handle));
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn flush_failures_resolve_their_requests() {
        let (mut dispatcher, _inbound, _, _) = two_engine_dispatcher();
        let (outcomes, completion) = outcome_log();
        let failing = dispatcher.submit(&"engine-a".into(), addr(9), b"doomed".to_vec(), completion()).unwrap();
        let ok = dispatcher.submit(&"engine-a".into(), addr(162), b"fine".to_vec(), completion()).unwrap();
        let sink = RecordingSink { unreachable: vec![9], ..Default::default() };
        dispatcher.connection_established(&key("A"), sink.clone()).unwrap();
        assert!(!dispatcher.correlator().is_pending(failing));
        assert!(dispatcher.correlator().is_pending(ok));
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], RequestOutcome::ErrorIndication(ErrorIndication::SendFailed(_))));
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn closed_transport_fails_correlated_requests() {
        let (mut dispatcher, _inbound, _, _) = two_engine_dispatcher();
        let (outcomes, completion) = outcome_log();
        let queued = dispatcher.submit(&"engine-b".into(), addr(1162), b"q".to_vec(), completion()).unwrap();
        dispatcher.connection_lost(&key("B"), ReconnectPolicy::Close).unwrap();
        assert!(!dispatcher.correlator().is_pending(queued));
        let late = dispatcher.submit(&"engine-b".into(), addr(1162), b"late".to_vec(), completion()).unwrap();
        assert!(!dispatcher.correlator().is_pending(late));
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(*outcomes, vec![ErrorIndication::TransportClosed.into(), ErrorIndication::TransportClosed.into()]);
        let err = dispatcher.send_message(&key("B"), vec![], addr(1)).unwrap_err();
        assert!(matches!(err, DispatchError::Transport(TransportError::Closed)));
    }

    #[test]
    fn replies_resolve_through_the_owning_engine() {
        let (mut dispatcher, mut inbound) = Dispatcher::<RecordingSink>::new();
        dispatcher.register_transport(key("A"), transport("A")).unwrap();
        dispatcher.register_engine(key("A"), Box::new(PeerAckEngine::new("ack".into()))).unwrap();
        dispatcher.set_routing_rule(Box::new(SoleKey::new("A")));
        dispatcher.connection_established(&key("A"), RecordingSink::default()).unwrap();
        let (outcomes, completion) = outcome_log();
        let handle = dispatcher.submit(&"ack".into(), addr(162), b"inform".to_vec(), completion()).unwrap();
        dispatcher.datagram_received(&key("A"), b"ack".to_vec(), addr(162));
        drain(&mut dispatcher, &mut inbound);
        assert!(!dispatcher.correlator().is_pending(handle));
        assert_eq!(*outcomes.lock().unwrap(), vec![RequestOutcome::Success(vec![])]);
        // A second resolution is a caller bug
        let err = dispatcher.resolve(handle, RequestOutcome::Success(vec![])).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownHandle(_)));
    }

    #[test]
    fn unregistering_an_engine_cancels_its_requests() {
        let (mut dispatcher, _inbound, _, _) = two_engine_dispatcher();
        let (outcomes, completion) = outcome_log();
        dispatcher.submit(&"engine-a".into(), addr(162), b"1".to_vec(), completion()).unwrap();
        let kept = dispatcher.submit(&"engine-b".into(), addr(1162), b"2".to_vec(), completion()).unwrap();
        let (_, cancelled) = dispatcher.unregister_engine(&"engine-a".into()).unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(*outcomes.lock().unwrap(), vec![RequestOutcome::cancelled()]);
        assert!(dispatcher.correlator().is_pending(kept));
        let err = dispatcher.submit(&"engine-a".into(), addr(162), vec![], completion()).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownEngine(_)));
    }

    #[test]
    fn stop_cancels_everything_and_closes_transports() {
        let (mut dispatcher, mut inbound, seen_a, _) = two_engine_dispatcher();
        let (outcomes, completion) = outcome_log();
        for i in 0..4u16 {
            dispatcher.submit(&"engine-a".into(), addr(162 + 3 * i), vec![i as u8], completion()).unwrap();
        }
        dispatcher.submit(&"engine-b".into(), addr(1162), vec![9], completion()).unwrap();
        dispatcher.datagram_received(&key("A"), b"late".to_vec(), addr(162));

        assert_eq!(dispatcher.stop(), 5);
        assert_eq!(dispatcher.stop(), 0);
        assert!(dispatcher.correlator().is_empty());
        assert_eq!(outcomes.lock().unwrap().len(), 5);
        assert!(outcomes.lock().unwrap().iter().all(|o| *o == RequestOutcome::cancelled()));
        assert_eq!(dispatcher.transport_state(&key("A")), Some(TransportState::Closed));
        assert_eq!(dispatcher.transport_state(&key("B")), Some(TransportState::Closed));

        // Nothing fires after stop
        drain(&mut dispatcher, &mut inbound);
        assert!(seen_a.lock().unwrap().is_empty());
        let err = dispatcher.register_transport(key("C"), transport("C")).unwrap_err();
        assert!(matches!(err, DispatchError::Stopped));
        let err = dispatcher.register_engine(key("A"), Box::new(EchoEngine::new("x".into()))).unwrap_err();
        assert!(matches!(err, DispatchError::Stopped));
    }

    #[test]
    fn engines_hear_about_requests_finished_elsewhere() {
        let (mut dispatcher, _inbound) = Dispatcher::<RecordingSink>::new();
        dispatcher.register_transport(key("A"), transport("A")).unwrap();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let tracker = FinishTracker { id: "t".into(), finished: finished.clone() };
        dispatcher.register_engine(key("A"), Box::new(tracker)).unwrap();
        let (_, completion) = outcome_log();
        let timed_out = dispatcher.submit(&"t".into(), addr(162), vec![1], completion()).unwrap();
        let cancelled = dispatcher.submit(&"t".into(), addr(162), vec![2], completion()).unwrap();
        let unsent = dispatcher.submit(&"t".into(), addr(9), vec![3], completion()).unwrap();
        dispatcher.resolve(timed_out, ErrorIndication::RequestTimedOut.into()).unwrap();
        dispatcher.cancel(cancelled).unwrap();
        dispatcher.connection_established(&key("A"), RecordingSink { unreachable: vec![9], ..Default::default() }).unwrap();
        assert_eq!(*finished.lock().unwrap(), vec![timed_out, cancelled, unsent]);
        assert!(dispatcher.correlator().is_empty());
    }

    #[test]
    fn timed_out_requests_do_not_pile_up_in_the_ack_engine() {
        let (mut dispatcher, mut inbound) = Dispatcher::<RecordingSink>::new();
        dispatcher.register_transport(key("A"), transport("A")).unwrap();
        dispatcher.register_engine(key("A"), Box::new(PeerAckEngine::new("ack".into()))).unwrap();
        dispatcher.set_routing_rule(Box::new(SoleKey::new("A")));
        dispatcher.connection_established(&key("A"), RecordingSink::default()).unwrap();
        let (outcomes, completion) = outcome_log();
        for i in 0..1000u16 {
            let handle = dispatcher.submit(&"ack".into(), addr(2000 + i % 5), vec![], completion()).unwrap();
            dispatcher.resolve(handle, ErrorIndication::RequestTimedOut.into()).unwrap();
        }
        assert!(dispatcher.correlator().is_empty());
        // A stale handle would soak up this acknowledgement
        let live = dispatcher.submit(&"ack".into(), addr(2000), vec![], completion()).unwrap();
        dispatcher.datagram_received(&key("A"), b"ack".to_vec(), addr(2000));
        drain(&mut dispatcher, &mut inbound);
        assert!(!dispatcher.correlator().is_pending(live));
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1001);
        assert_eq!(outcomes[1000], RequestOutcome::Success(vec![]));
    }

    #[test]
    fn full_send_buffer_holds_requests_until_flushed() {
        let (mut dispatcher, _inbound, _, _) = two_engine_dispatcher();
        let sink = RecordingSink::default();
        dispatcher.connection_established(&key("A"), sink.clone()).unwrap();
        let (outcomes, completion) = outcome_log();
        sink.stalled.store(1, Ordering::SeqCst);
        let handle = dispatcher.submit(&"engine-a".into(), addr(162), b"inform".to_vec(), completion()).unwrap();
        assert!(dispatcher.correlator().is_pending(handle));
        assert!(outcomes.lock().unwrap().is_empty());
        assert_eq!(dispatcher.backlogged().collect::<Vec<_>>(), vec![&key("A")]);

        dispatcher.flush(&key("A")).unwrap();
        assert_eq!(dispatcher.backlogged().count(), 0);
        assert_eq!(*sink.sent.lock().unwrap(), vec![(b"inform".to_vec(), addr(162))]);
        assert!(dispatcher.correlator().is_pending(handle));
    }

    #[tokio::test]
    async fn scheduled_datagrams_arrive_in_order() {
        let (mut dispatcher, mut inbound, seen_a, _) = two_engine_dispatcher();
        for i in 0..10u8 {
            dispatcher.datagram_received(&key("A"), vec![i], addr(162));
        }
        for _ in 0..10 {
            let datagram = inbound.next().await.unwrap();
            dispatcher.route_inbound(datagram);
        }
        let payloads: Vec<_> = seen_a.lock().unwrap().iter().map(|(_, _, p)| p[0]).collect();
        assert_eq!(payloads, (0..10u8).collect::<Vec<_>>());
    }
}
