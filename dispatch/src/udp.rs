//! UDP plumbing for the event loop.
//!
//! Binding and reading happen on their own tokio tasks, which report back to the event loop with [`IoEvent`]s. All
//! state changes happen on the loop itself. Sends are made directly from the loop with `try_send_to`, so they never
//! await. A send that would block is left queued on its transport, and [`spawn_writable_watch`] tells the loop when
//! to try again.
//!
//! The event channel is bounded. A reader that gets ahead of the loop waits, and the kernel drops what no longer fits
//! in the socket's receive buffer.

use futures::channel::mpsc;
use futures::SinkExt;
use libcarrier::{DatagramSink, DomainKey};
use log::*;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Largest possible UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

#[derive(Clone, Debug)]
pub struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramSink for UdpSink {
    fn send_to(&mut self, payload: &[u8], destination: SocketAddr) -> std::io::Result<()> {
        let sent = self.socket.try_send_to(payload, destination)?;
        if sent < payload.len() {
            return Err(std::io::Error::new(
                ErrorKind::WriteZero,
                format!("only {sent} of {} bytes were sent", payload.len()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum IoEvent {
    Bound { key: DomainKey, socket: Arc<UdpSocket> },
    BindFailed { key: DomainKey, error: std::io::Error },
    Datagram { key: DomainKey, source: SocketAddr, payload: Vec<u8> },
    ReadFailed { key: DomainKey, error: std::io::Error },
    Writable { key: DomainKey },
}

impl IoEvent {
    pub fn key(&self) -> &DomainKey {
        match self {
            IoEvent::Bound { key, .. }
            | IoEvent::BindFailed { key, .. }
            | IoEvent::Datagram { key, .. }
            | IoEvent::ReadFailed { key, .. }
            | IoEvent::Writable { key } => key,
        }
    }
}

/// Bind a socket on `addr` in the background and report the result on `events`.
pub fn spawn_bind(key: DomainKey, addr: SocketAddr, mut events: mpsc::Sender<IoEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = match UdpSocket::bind(addr).await {
            Ok(socket) => {
                debug!("[{key}] bound to {}", socket.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| addr.to_string()));
                IoEvent::Bound { key, socket: Arc::new(socket) }
            }
            Err(error) => IoEvent::BindFailed { key, error },
        };
        if events.send(event).await.is_err() {
            trace!("Event loop is gone. Bind result discarded.");
        }
    })
}

/// Read datagrams from `socket` until it fails or the event loop goes away.
pub fn spawn_reader(key: DomainKey, socket: Arc<UdpSocket>, mut events: mpsc::Sender<IoEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    let event = IoEvent::Datagram { key: key.clone(), source, payload: buf[..len].to_vec() };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                // ICMP errors from an earlier send surface here on some platforms. The socket is still usable.
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                    debug!("[{key}] ignoring read error. {e}");
                }
                Err(error) => {
                    let _ = events.send(IoEvent::ReadFailed { key: key.clone(), error }).await;
                    break;
                }
            }
        }
        trace!("[{key}] reader finished");
    })
}

/// Report [`IoEvent::Writable`] once `socket` can take another datagram.
pub fn spawn_writable_watch(key: DomainKey, socket: Arc<UdpSocket>, mut events: mpsc::Sender<IoEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        // The retried send surfaces any real error
        if let Err(e) = socket.writable().await {
            debug!("[{key}] waiting for writability failed. {e}");
        }
        let _ = events.send(IoEvent::Writable { key }).await;
    })
}
