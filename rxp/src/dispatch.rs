//! Inbound packet routing
//!
//! A socket has exactly one reader thread. It pulls validated packets from the
//! communicator and hands each one to the connection registered for its
//! source endpoint; everything else goes to the listener backlog. Per-route
//! channels are bounded, so a connection that falls behind slows the reader
//! down instead of growing an unbounded queue.

use crate::communicator::Communicator;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use rxp_protocol::Packet;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Routing table from remote endpoint to connection inbox
pub(crate) struct Router {
    routes: Mutex<HashMap<SocketAddr, Sender<Packet>>>,
    backlog_tx: Sender<Packet>,
    backlog_rx: Receiver<Packet>,
    depth: usize,
}

impl Router {
    pub(crate) fn new(depth: usize) -> Self {
        let (backlog_tx, backlog_rx) = channel::bounded(depth);
        Router {
            routes: Mutex::new(HashMap::new()),
            backlog_tx,
            backlog_rx,
            depth,
        }
    }

    /// Open an inbox for packets from `remote`, replacing any previous one
    pub(crate) fn register(&self, remote: SocketAddr) -> Receiver<Packet> {
        let (tx, rx) = channel::bounded(self.depth);
        self.routes.lock().insert(remote, tx);
        rx
    }

    pub(crate) fn remove(&self, remote: SocketAddr) {
        self.routes.lock().remove(&remote);
    }

    #[cfg(test)]
    pub(crate) fn has_route(&self, remote: SocketAddr) -> bool {
        self.routes.lock().contains_key(&remote)
    }

    /// Hand `packet` to its connection, blocking while the inbox is full
    ///
    /// Gives the packet back if no live route exists.
    pub(crate) fn deliver(&self, packet: Packet) -> Result<(), Packet> {
        let source = packet.source;
        let Some(tx) = self.routes.lock().get(&source).cloned() else {
            return Err(packet);
        };
        match tx.send(packet) {
            Ok(()) => Ok(()),
            Err(channel::SendError(packet)) => {
                tracing::debug!("Route to {} is gone, removing it", source);
                let mut routes = self.routes.lock();
                if routes.get(&source).map_or(false, |current| current.same_channel(&tx)) {
                    routes.remove(&source);
                }
                Err(packet)
            }
        }
    }

    /// Deliver to a connection, or queue for the listener
    pub(crate) fn route(&self, packet: Packet) {
        let Err(packet) = self.deliver(packet) else {
            return;
        };
        match self.backlog_tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                tracing::warn!("Listener backlog full, dropping {}", packet);
            }
            Err(TrySendError::Disconnected(packet)) => {
                tracing::warn!("Listener backlog closed, dropping {}", packet);
            }
        }
    }

    /// Next packet no connection claimed, waiting at most `timeout`
    pub(crate) fn next_unrouted(&self, timeout: Duration) -> Option<Packet> {
        match self.backlog_rx.recv_timeout(timeout) {
            Ok(packet) => Some(packet),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Start the reader thread for `communicator`
///
/// The thread only holds a weak reference between reads and exits once the
/// communicator has been dropped.
pub(crate) fn spawn_reader(communicator: &Arc<Communicator>) -> io::Result<()> {
    let weak = Arc::downgrade(communicator);
    thread::Builder::new()
        .name(format!("rxp-reader-{}", communicator.local_addr()))
        .spawn(move || run(weak))?;
    Ok(())
}

fn run(weak: Weak<Communicator>) {
    while let Some(communicator) = weak.upgrade() {
        match communicator.receive_packet() {
            Ok(Some(packet)) => communicator.router().route(packet),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Receive failed on {}: {}", communicator.local_addr(), e);
                thread::sleep(communicator.config().poll_interval);
            }
        }
    }
    tracing::debug!("Reader thread exiting");
}
