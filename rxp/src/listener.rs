//! RxP Listener
//!
//! Owns the communicator for one bound local socket and performs the
//! three-way handshake: SYN → SYN+ACK → ACK. `accept` turns the packets no
//! connection claimed into new connections; `connect` runs the client side.

use crate::communicator::{Communicator, CommunicatorError};
use crate::config::RxpConfig;
use crate::connection::{Connection, ConnectionError};
use parking_lot::Mutex;
use rxp_protocol::{ConnectionState, Flags, Packet};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Listener errors
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Communicator error: {0}")]
    Communicator(#[from] CommunicatorError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("No handshake completed within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("No connection accepted within {0:?}")]
    AcceptTimeout(Duration),
}

/// RxP endpoint bound to one local socket
pub struct Listener {
    communicator: Arc<Communicator>,
    /// Peers that sent a SYN and have not yet sent the final ACK
    pending: Mutex<HashMap<SocketAddr, Connection>>,
    /// Handshaken connections; entries are replaced, never removed
    established: Mutex<HashMap<SocketAddr, Connection>>,
}

impl Listener {
    /// Bind `local` and start reading from it
    pub fn listen(local: SocketAddr, config: RxpConfig) -> Result<Self, ListenerError> {
        let communicator = Communicator::bind(local, config)?;
        communicator.start_dispatch()?;
        tracing::info!("Listening on {}", communicator.local_addr());

        Ok(Listener {
            communicator,
            pending: Mutex::new(HashMap::new()),
            established: Mutex::new(HashMap::new()),
        })
    }

    /// Open a connection from `local` to `remote`
    ///
    /// Blocks until the peer answers the SYN, or until
    /// [`RxpConfig::connect_timeout`] elapses if one is set.
    pub fn connect(
        local: SocketAddr,
        remote: SocketAddr,
        window_size: usize,
        config: RxpConfig,
    ) -> Result<Connection, ListenerError> {
        if window_size == 0 {
            return Err(ConnectionError::InvalidWindowSize.into());
        }
        let listener = Listener::listen(local, config)?;
        listener.handshake(remote, window_size)
    }

    fn handshake(&self, remote: SocketAddr, window_size: usize) -> Result<Connection, ListenerError> {
        let communicator = &self.communicator;
        let local = communicator.local_addr();
        let config = communicator.config();
        let deadline = config.connect_timeout.map(|timeout| (Instant::now() + timeout, timeout));

        let syn_seq = communicator.send_syn(remote)?;
        tracing::info!("Connecting {} -> {}", local, remote);

        loop {
            if let Some((deadline, timeout)) = deadline {
                if Instant::now() >= deadline {
                    communicator.cancel(syn_seq);
                    return Err(ListenerError::HandshakeTimeout(timeout));
                }
            }

            let Some(packet) = communicator.next_unrouted(config.poll_interval) else {
                continue;
            };
            let answers_syn = packet.flags.contains(Flags::SYN | Flags::ACK)
                && packet.ack == Some(syn_seq)
                && addressed_to(local, packet.destination);
            if !answers_syn {
                tracing::debug!("Ignoring {} while connecting", packet);
                continue;
            }

            let connection = Connection::new(
                Arc::clone(communicator),
                packet.source,
                window_size,
                Some(syn_seq),
                packet.sequence,
            )?;
            connection.establish()?;
            communicator.send_ack(&packet)?;

            self.established
                .lock()
                .insert(packet.source, connection.clone());
            return Ok(connection);
        }
    }

    /// Wait for the next peer to complete a handshake
    pub fn accept(&self) -> Result<Connection, ListenerError> {
        let poll = self.communicator.config().poll_interval;
        loop {
            if let Some(connection) = self.accept_once(poll)? {
                return Ok(connection);
            }
        }
    }

    /// Like [`Listener::accept`], giving up after `timeout`
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Connection, ListenerError> {
        let deadline = Instant::now() + timeout;
        let poll = self.communicator.config().poll_interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ListenerError::AcceptTimeout(timeout));
            }
            if let Some(connection) = self.accept_once(poll.min(deadline - now))? {
                return Ok(connection);
            }
        }
    }

    fn accept_once(&self, wait: Duration) -> Result<Option<Connection>, ListenerError> {
        match self.communicator.next_unrouted(wait) {
            Some(packet) => self.on_packet(packet),
            None => Ok(None),
        }
    }

    fn on_packet(&self, packet: Packet) -> Result<Option<Connection>, ListenerError> {
        let remote = packet.source;

        if packet.flags.contains(Flags::SYN) && !packet.flags.contains(Flags::ACK) {
            if self.pending.lock().contains_key(&remote) {
                tracing::debug!("Duplicate SYN from {}", remote);
                return Ok(None);
            }
            let live = self
                .established
                .lock()
                .get(&remote)
                .map_or(false, |c| c.state() != ConnectionState::Closed);
            if !live {
                self.open(&packet)?;
                return Ok(None);
            }
        }

        if packet.flags.contains(Flags::ACK) {
            let promoted = self.pending.lock().remove(&remote);
            if let Some(connection) = promoted {
                connection.establish()?;
                self.established.lock().insert(remote, connection.clone());
                return Ok(Some(connection));
            }
        }

        if self.established.lock().contains_key(&remote) {
            if !self.communicator.deliver(packet) {
                tracing::debug!("Dropping packet for closed connection to {}", remote);
            }
        } else {
            tracing::debug!("Ignoring {}", packet);
        }
        Ok(None)
    }

    /// Answer a SYN and park the new connection as pending
    fn open(&self, syn: &Packet) -> Result<(), ListenerError> {
        let seq = self.communicator.send_syn_ack(syn)?;
        let connection = Connection::new(
            Arc::clone(&self.communicator),
            syn.source,
            self.communicator.config().window_size,
            Some(seq),
            syn.sequence,
        )?;
        self.pending.lock().insert(syn.source, connection);
        tracing::debug!("SYN from {}, connection pending", syn.source);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.communicator.local_addr()
    }

    pub fn config(&self) -> &RxpConfig {
        self.communicator.config()
    }

    /// Connections waiting for the final handshake ACK
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Connections that completed the handshake
    pub fn established_count(&self) -> usize {
        self.established.lock().len()
    }
}

/// Whether `destination` names the socket bound to `local`
fn addressed_to(local: SocketAddr, destination: SocketAddr) -> bool {
    destination == local || (local.ip().is_unspecified() && destination.port() == local.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxp_io::RxpSocket;
    use std::thread;

    fn test_config() -> RxpConfig {
        RxpConfig {
            poll_interval: Duration::from_millis(20),
            ..RxpConfig::default()
        }
    }

    fn raw_peer() -> RxpSocket {
        let socket = RxpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        socket
    }

    fn recv(socket: &RxpSocket) -> Packet {
        let mut buf = [0u8; 512];
        let (n, _) = socket.recv_from(&mut buf).unwrap().expect("datagram");
        Packet::from_bytes(&buf[..n]).unwrap()
    }

    #[test]
    fn test_three_way_handshake() {
        let listener = Listener::listen("127.0.0.1:0".parse().unwrap(), test_config()).unwrap();
        let local = listener.local_addr();
        let peer = raw_peer();

        peer.send_to(&Packet::syn(peer.local_addr(), local, 40).to_bytes(), local)
            .unwrap();
        assert!(matches!(
            listener.accept_timeout(Duration::from_millis(200)),
            Err(ListenerError::AcceptTimeout(_))
        ));
        assert_eq!(listener.pending_count(), 1);

        let syn_ack = recv(&peer);
        assert_eq!(syn_ack.flags, Flags::SYN | Flags::ACK);
        assert_eq!(syn_ack.ack, Some(40));
        let server_seq = syn_ack.sequence.unwrap();

        peer.send_to(
            &Packet::ack(peer.local_addr(), local, server_seq).to_bytes(),
            local,
        )
        .unwrap();
        let connection = listener.accept_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(connection.state(), ConnectionState::Established);
        assert_eq!(connection.remote_addr(), peer.local_addr());
        assert_eq!(connection.last_seq(), Some(server_seq));
        assert_eq!(connection.last_ack(), Some(40));
        assert_eq!(listener.pending_count(), 0);
        assert_eq!(listener.established_count(), 1);
        assert!(!listener.communicator.is_pending(server_seq));
    }

    #[test]
    fn test_duplicate_syn_ignored() {
        let listener = Listener::listen("127.0.0.1:0".parse().unwrap(), test_config()).unwrap();
        let local = listener.local_addr();
        let peer = raw_peer();

        let syn = Packet::syn(peer.local_addr(), local, 7).to_bytes();
        peer.send_to(&syn, local).unwrap();
        peer.send_to(&syn, local).unwrap();
        let _ = listener.accept_timeout(Duration::from_millis(200));

        assert_eq!(listener.pending_count(), 1);
        assert_eq!(listener.communicator.pending_count(), 1);
    }

    #[test]
    fn test_connect_and_accept() {
        let listener = Listener::listen("127.0.0.1:0".parse().unwrap(), test_config()).unwrap();
        let server_addr = listener.local_addr();

        let client = thread::spawn(move || {
            Listener::connect("127.0.0.1:0".parse().unwrap(), server_addr, 4, test_config())
        });
        let server = listener.accept_timeout(Duration::from_secs(3)).unwrap();
        let client = client.join().unwrap().unwrap();

        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(client.remote_addr(), server_addr);
        assert_eq!(server.remote_addr(), client.local_addr());
        assert_eq!(client.window_size(), 4);
        assert_eq!(server.window_size(), 1);
    }

    #[test]
    fn test_connect_timeout() {
        let silent = raw_peer();
        let config = RxpConfig {
            connect_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        };
        let err = Listener::connect(
            "127.0.0.1:0".parse().unwrap(),
            silent.local_addr(),
            1,
            config,
        )
        .unwrap_err();
        assert!(matches!(err, ListenerError::HandshakeTimeout(_)));
    }

    #[test]
    fn test_connect_rejects_zero_window() {
        let err = Listener::connect(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            0,
            test_config(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ListenerError::Connection(ConnectionError::InvalidWindowSize)
        ));
    }

    #[test]
    fn test_addressed_to() {
        let local: SocketAddr = "0.0.0.0:5000".parse().unwrap();
        assert!(addressed_to(local, "127.0.0.1:5000".parse().unwrap()));
        assert!(!addressed_to(local, "127.0.0.1:5001".parse().unwrap()));
        let bound: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert!(addressed_to(bound, bound));
        assert!(!addressed_to(bound, "10.0.0.1:5000".parse().unwrap()));
    }
}
