use crate::client::DispatcherClient;
use crate::errors::DispatchError;
use crate::target::{AuthData, TargetEntry, TransportTarget};
use futures::channel::oneshot;
use libcarrier::{EngineId, ErrorIndication, RequestHandle, RequestOutcome};
use log::*;

/// Sends notifications on behalf of any registered engine, and delivers their outcomes.
///
/// Encoding is the caller's business: `payload` is sent as is. The security parameters are only used for
/// attribution in logs.
#[derive(Clone)]
pub struct NotificationOriginator {
    client: DispatcherClient,
}

impl NotificationOriginator {
    pub fn new(client: DispatcherClient) -> Self {
        Self { client }
    }

    /// Send `payload` to `target` on behalf of `engine`. `on_complete` receives `context` and the outcome.
    ///
    /// If the target has a timeout, the request fails with [`ErrorIndication::RequestTimedOut`] unless something
    /// else resolved it first.
    pub async fn send_notification<C, F>(
        &mut self,
        engine: EngineId,
        security: &AuthData,
        target: &TransportTarget,
        payload: Vec<u8>,
        context: C,
        on_complete: F,
    ) -> Result<RequestHandle, DispatchError>
    where
        C: Send + 'static,
        F: FnOnce(C, RequestOutcome) + Send + 'static,
    {
        let destination = target.resolve().await?;
        let handle = self
            .client
            .send_request_with_callback(engine.clone(), destination, payload, move |outcome| {
                on_complete(context, outcome)
            })
            .await?;
        info!("Notification {handle} from engine {engine} to {target} as {}", security.security_name());
        if let Some(timeout) = target.timeout() {
            let mut client = self.client.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                match client.resolve(handle, ErrorIndication::RequestTimedOut.into()).await {
                    Ok(()) => debug!("Notification {handle} timed out after {}ms", timeout.as_millis()),
                    Err(DispatchError::UnknownHandle(_)) => trace!("Notification {handle} completed before its timeout"),
                    Err(e) => trace!("Timeout for notification {handle} not delivered. {e}"),
                }
            });
        }
        Ok(handle)
    }

    /// Send `payload` to a configured target. The outcome arrives on the returned receiver.
    pub async fn notify(
        &mut self,
        engine: EngineId,
        target: &TargetEntry,
        payload: Vec<u8>,
    ) -> Result<(RequestHandle, oneshot::Receiver<RequestOutcome>), DispatchError> {
        let (sender, receiver) = oneshot::channel();
        let handle = self
            .send_notification(engine, &target.auth, &target.transport, payload, sender, |sender, outcome| {
                let _ = sender.send(outcome);
            })
            .await?;
        Ok((handle, receiver))
    }
}
