//! Correlation of outbound requests with their asynchronous outcomes.
//!
//! Every request or notification that expects an answer is registered with a [`RequestCorrelator`] before it is
//! handed to a transport. Registration mints a [`RequestHandle`] that is returned to the caller straight away. The
//! handle is later resolved exactly once, by whichever of these happens first:
//!
//! - the owning engine decodes a matching reply and calls [`RequestCorrelator::resolve`],
//! - the transport reports that the write failed, which resolves with an [`ErrorIndication`],
//! - a timeout fires outside the carrier and resolves with [`ErrorIndication::RequestTimedOut`],
//! - the engine is unregistered, or the dispatcher stops, which resolves with [`ErrorIndication::Cancelled`].
//!
//! Resolving a handle a second time is a caller bug, and is reported as an [`UnknownHandleError`].

use crate::domain::EngineId;
use crate::error::UnknownHandleError;
use futures::channel::oneshot;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use thiserror::Error;

/// A unique token identifying one in-flight request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(pub(crate) u64);

impl RequestHandle {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Display for RequestHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A variable binding carried by a reply. The value is left encoded; the carrier never decodes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarBind {
    pub name: String,
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

impl VarBind {
    pub fn new<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Self { name: name.into(), value }
    }
}

impl Display for VarBind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = 0x{}", self.name, hex::encode(&self.value))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Why a request could not complete.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ErrorIndication {
    #[error("The request could not be sent. {0}")]
    SendFailed(String),
    #[error("The transport closed before the request was sent.")]
    TransportClosed,
    #[error("The request was cancelled.")]
    Cancelled,
    #[error("No response was received before the request timed out.")]
    RequestTimedOut,
    #[error("{0}")]
    Other(String),
}

/// The terminal result delivered for a request handle. Exactly one of these is delivered per handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Success(Vec<VarBind>),
    ErrorIndication(ErrorIndication),
    ErrorStatus { code: u32, index: u32, var_binds: Vec<VarBind> },
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success(_))
    }

    pub fn cancelled() -> Self {
        RequestOutcome::ErrorIndication(ErrorIndication::Cancelled)
    }
}

impl From<ErrorIndication> for RequestOutcome {
    fn from(indication: ErrorIndication) -> Self {
        RequestOutcome::ErrorIndication(indication)
    }
}

impl Display for RequestOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestOutcome::Success(var_binds) => write!(f, "Success ({} var-binds)", var_binds.len()),
            RequestOutcome::ErrorIndication(e) => write!(f, "Error indication: {e}"),
            RequestOutcome::ErrorStatus { code, index, .. } => write!(f, "Error status {code} @{index}"),
        }
    }
}

/// The callback that receives a request's outcome.
pub type Completion = Box<dyn FnOnce(RequestOutcome) + Send>;

struct PendingRequest {
    engine: EngineId,
    completion: Completion,
}

/// Tracks requests awaiting an outcome, keyed by [`RequestHandle`].
pub struct RequestCorrelator {
    next_handle: u64,
    pending: HashMap<RequestHandle, PendingRequest>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for RequestCorrelator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestCorrelator({} pending)", self.pending.len())
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self { next_handle: 1, pending: HashMap::new() }
    }

    /// Register a pending request whose outcome is delivered to `completion`.
    pub fn register_completion(&mut self, engine: EngineId, completion: Completion) -> RequestHandle {
        let handle = RequestHandle(self.next_handle);
        self.next_handle += 1;
        trace!("Registering request {handle} for engine {engine}");
        self.pending.insert(handle, PendingRequest { engine, completion });
        handle
    }

    /// Register a pending request. `callback` is invoked with `context` and the outcome when the handle resolves.
    pub fn register<C, F>(&mut self, engine: EngineId, context: C, callback: F) -> RequestHandle
    where
        C: Send + 'static,
        F: FnOnce(C, RequestOutcome) + Send + 'static,
    {
        self.register_completion(engine, Box::new(move |outcome| callback(context, outcome)))
    }

    /// Register a pending request whose outcome is delivered on a oneshot channel.
    pub fn register_channel(&mut self, engine: EngineId) -> (RequestHandle, oneshot::Receiver<RequestOutcome>) {
        let (sender, receiver) = oneshot::channel();
        let handle = self.register_completion(
            engine,
            Box::new(move |outcome| {
                if sender.send(outcome).is_err() {
                    debug!("Request outcome dropped. The receiver is gone.");
                }
            }),
        );
        (handle, receiver)
    }

    /// Remove the pending entry for `handle` and deliver `outcome` to it.
    pub fn resolve(&mut self, handle: RequestHandle, outcome: RequestOutcome) -> Result<(), UnknownHandleError> {
        let pending = self.pending.remove(&handle).ok_or(UnknownHandleError(handle))?;
        debug!("Resolving request {handle} for engine {}: {outcome}", pending.engine);
        (pending.completion)(outcome);
        Ok(())
    }

    /// Remove the pending entry for `handle` without delivering an outcome.
    pub fn cancel(&mut self, handle: RequestHandle) -> Result<EngineId, UnknownHandleError> {
        let pending = self.pending.remove(&handle).ok_or(UnknownHandleError(handle))?;
        debug!("Request {handle} for engine {} withdrawn", pending.engine);
        Ok(pending.engine)
    }

    /// Resolve every request belonging to `engine` with [`ErrorIndication::Cancelled`].
    pub fn cancel_engine(&mut self, engine: &EngineId) -> usize {
        let handles = self.handles_where(|pending| &pending.engine == engine);
        self.cancel_handles(handles)
    }

    /// Resolve every pending request with [`ErrorIndication::Cancelled`].
    pub fn cancel_all(&mut self) -> usize {
        let handles = self.handles_where(|_| true);
        self.cancel_handles(handles)
    }

    pub fn is_pending(&self, handle: RequestHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    pub fn engine_of(&self, handle: RequestHandle) -> Option<&EngineId> {
        self.pending.get(&handle).map(|pending| &pending.engine)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn handles_where<P: Fn(&PendingRequest) -> bool>(&self, predicate: P) -> Vec<RequestHandle> {
        let mut handles: Vec<_> =
            self.pending.iter().filter(|(_, pending)| predicate(pending)).map(|(handle, _)| *handle).collect();
        handles.sort();
        handles
    }

    fn cancel_handles(&mut self, handles: Vec<RequestHandle>) -> usize {
        let count = handles.len();
        for handle in handles {
            if let Some(pending) = self.pending.remove(&handle) {
                (pending.completion)(RequestOutcome::cancelled());
            }
        }
        if count > 0 {
            debug!("Cancelled {count} pending requests");
        }
        count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(String, RequestOutcome)>>>;

    fn recorder(log: &Log) -> impl FnOnce(String, RequestOutcome) + Send + 'static {
        let log = Arc::clone(log);
        move |ctx, outcome| log.lock().unwrap().push((ctx, outcome))
    }

    #[test]
    fn handles_are_unique_and_resolve_once() {
        let log = Log::default();
        let mut correlator = RequestCorrelator::new();
        let engine = EngineId::from("engine-a");
        let h1 = correlator.register(engine.clone(), "first".to_string(), recorder(&log));
        let h2 = correlator.register(engine.clone(), "second".to_string(), recorder(&log));
        assert_ne!(h1, h2);
        assert_eq!(correlator.len(), 2);

        correlator.resolve(h2, RequestOutcome::Success(vec![VarBind::new("1.3.6.1.2.1.1.1.0", b"x".to_vec())])).unwrap();
        assert_eq!(correlator.resolve(h2, RequestOutcome::Success(vec![])), Err(UnknownHandleError(h2)));
        assert!(correlator.is_pending(h1));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "second");
        assert!(log[0].1.is_success());
    }

    #[test]
    fn unknown_handle_is_an_error() {
        let mut correlator = RequestCorrelator::new();
        let err = correlator.resolve(RequestHandle(42), RequestOutcome::cancelled()).unwrap_err();
        assert_eq!(err, UnknownHandleError(RequestHandle(42)));
        assert!(correlator.cancel(RequestHandle(42)).is_err());
    }

    #[test]
    fn cancel_withdraws_without_callback() {
        let log = Log::default();
        let mut correlator = RequestCorrelator::new();
        let handle = correlator.register(EngineId::from("e"), "ctx".to_string(), recorder(&log));
        assert_eq!(correlator.cancel(handle).unwrap(), EngineId::from("e"));
        assert!(correlator.is_empty());
        assert!(log.lock().unwrap().is_empty());
        assert!(correlator.resolve(handle, RequestOutcome::cancelled()).is_err());
    }

    #[test]
    fn cancel_engine_only_touches_that_engine() {
        let log = Log::default();
        let mut correlator = RequestCorrelator::new();
        let a = EngineId::from("a");
        let b = EngineId::from("b");
        correlator.register(a.clone(), "a1".to_string(), recorder(&log));
        correlator.register(a.clone(), "a2".to_string(), recorder(&log));
        let hb = correlator.register(b.clone(), "b1".to_string(), recorder(&log));

        assert_eq!(correlator.cancel_engine(&a), 2);
        assert_eq!(correlator.len(), 1);
        assert_eq!(correlator.engine_of(hb), Some(&b));
        let log = log.lock().unwrap();
        assert_eq!(log.iter().map(|(ctx, _)| ctx.as_str()).collect::<Vec<_>>(), vec!["a1", "a2"]);
        assert!(log.iter().all(|(_, outcome)| *outcome == RequestOutcome::cancelled()));
    }

    #[test]
    fn cancel_all_leaves_nothing_pending() {
        let mut correlator = RequestCorrelator::new();
        let receivers: Vec<_> =
            (0..5).map(|i| correlator.register_channel(EngineId::new(format!("engine-{i}"))).1).collect();
        assert_eq!(correlator.cancel_all(), 5);
        assert!(correlator.is_empty());
        for mut receiver in receivers {
            assert_eq!(receiver.try_recv().unwrap(), Some(RequestOutcome::cancelled()));
        }
    }

    #[test]
    fn channel_completion_survives_dropped_receiver() {
        let mut correlator = RequestCorrelator::new();
        let (handle, receiver) = correlator.register_channel(EngineId::from("e"));
        drop(receiver);
        assert!(correlator.resolve(handle, ErrorIndication::RequestTimedOut.into()).is_ok());
    }
}
