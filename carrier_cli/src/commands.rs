use crate::settings::CarrierSettings;
use anyhow::anyhow;
use carrier_dispatch::{
    new_dispatcher, DispatcherClient, DispatcherConfig, EchoEngine, Engine, NotificationOriginator, PeerAckEngine,
    TargetEntry,
};
use futures::future::join_all;
use libcarrier::{EngineId, RequestHandle, RequestOutcome};
use log::*;
use std::time::Duration;

/// The result of one notification, for display.
#[derive(Debug)]
pub struct NotificationReport {
    pub target: String,
    pub engine: EngineId,
    pub handle: Option<RequestHandle>,
    pub outcome: Result<RequestOutcome, String>,
}

impl std::fmt::Display for NotificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handle = self.handle.map(|h| h.to_string()).unwrap_or_else(|| "-".into());
        match &self.outcome {
            Ok(outcome) => write!(f, "Notification {handle} for engine {} to {}: {outcome}", self.engine, self.target),
            Err(e) => write!(f, "Notification for engine {} to {} not sent: {e}", self.engine, self.target),
        }
    }
}

/// Spawn a dispatcher with every configured transport, engine and the routing rule.
pub async fn start_dispatcher<F, E>(settings: &CarrierSettings, make_engine: F) -> Result<DispatcherClient, anyhow::Error>
where
    F: Fn(EngineId) -> E,
    E: Engine + 'static,
{
    settings.validate()?;
    let (mut client, event_loop) = new_dispatcher(DispatcherConfig::default());
    tokio::spawn(event_loop.run());
    for transport in &settings.transports {
        client.open_udp_transport(transport.key.clone(), transport.bind).await?;
    }
    for engine in &settings.engines {
        client.register_engine(engine.domain.clone(), make_engine(engine.id.clone())).await?;
    }
    client.set_boxed_routing_rule(settings.routing.to_rule()?).await?;
    Ok(client)
}

/// Send `payload` to every configured target, each from the engine its replies will be routed to, and wait for
/// all of the outcomes.
pub async fn notify_all(
    settings: &CarrierSettings,
    payload: Vec<u8>,
    default_timeout: Duration,
) -> Result<Vec<NotificationReport>, anyhow::Error> {
    if settings.targets.is_empty() {
        return Err(anyhow!("No targets are configured."));
    }
    let rule = settings.routing.to_rule()?;
    let client = start_dispatcher(settings, PeerAckEngine::new).await?;
    let mut originator = NotificationOriginator::new(client.clone());
    let mut pending = Vec::new();
    let mut reports = Vec::new();
    for entry in &settings.targets {
        let mut entry: TargetEntry = entry.clone();
        entry.transport.set_default_timeout(default_timeout);
        let target = entry.transport.to_string();
        let sent = match entry.transport.resolve().await {
            Ok(addr) => settings
                .engine_for(rule.as_ref(), &addr)
                .map(|e| e.id.clone())
                .ok_or_else(|| anyhow!("No engine serves the routing key for {addr}.")),
            Err(e) => Err(e.into()),
        };
        let engine = match sent {
            Ok(engine) => engine,
            Err(e) => {
                warn!("Skipping {target}. {e}");
                reports.push(NotificationReport {
                    target,
                    engine: EngineId::new("-"),
                    handle: None,
                    outcome: Err(e.to_string()),
                });
                continue;
            }
        };
        match originator.notify(engine.clone(), &entry, payload.clone()).await {
            Ok((handle, receiver)) => pending.push((target, engine, handle, receiver)),
            Err(e) => reports.push(NotificationReport { target, engine, handle: None, outcome: Err(e.to_string()) }),
        }
    }
    let outcomes = join_all(pending.into_iter().map(|(target, engine, handle, receiver)| async move {
        let outcome = receiver.await.map_err(|_| "The dispatcher stopped before the outcome arrived".to_string());
        NotificationReport { target, engine, handle: Some(handle), outcome }
    }))
    .await;
    reports.extend(outcomes);
    let cancelled = client.stop().await?;
    debug!("Dispatcher stopped with {cancelled} requests outstanding");
    Ok(reports)
}

/// Start a dispatcher that echoes everything back to its sender.
pub async fn start_responder(settings: &CarrierSettings) -> Result<DispatcherClient, anyhow::Error> {
    start_dispatcher(settings, EchoEngine::new).await
}
