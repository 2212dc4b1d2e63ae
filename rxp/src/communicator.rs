//! Reliable delivery layer
//!
//! A [`Communicator`] owns one bound UDP socket. It builds and sends every
//! packet, keeps each SYN, FIN and DATA segment in the unacknowledged-packet
//! registry until the matching ACK arrives, and runs a retransmission sweep
//! while the registry is non-empty. Every connection multiplexed over the
//! socket shares the registry and the sequence counter.

use crate::config::{ConfigError, RxpConfig};
use crate::dispatch::{self, Router};
use bytes::Bytes;
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use rxp_io::{RxpSocket, SocketError};
use rxp_protocol::{Flags, Packet, SequenceCounter};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Communicator errors
#[derive(Error, Debug)]
pub enum CommunicatorError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Packet of {size} bytes exceeds the datagram size {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Cannot acknowledge a {0} packet without a sequence number")]
    MissingSequence(Flags),

    #[error("Failed to start {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
}

/// A packet awaiting acknowledgement
struct InFlight {
    destination: SocketAddr,
    flags: Flags,
    bytes: Bytes,
    sent_at: Instant,
    retransmissions: u32,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<u32, InFlight>,
    sweep_armed: bool,
}

/// Per-socket reliable delivery layer
pub struct Communicator {
    socket: RxpSocket,
    config: RxpConfig,
    sequence: SequenceCounter,
    registry: Mutex<Registry>,
    router: Router,
    dispatching: AtomicBool,
    me: Weak<Communicator>,
}

impl Communicator {
    /// Bind a socket on `local` and wrap it
    pub fn bind(local: SocketAddr, config: RxpConfig) -> Result<Arc<Self>, CommunicatorError> {
        config.validate()?;
        let socket = RxpSocket::bind(local)?;
        socket.set_read_timeout(Some(config.poll_interval))?;

        tracing::info!("Communicator bound on {}", socket.local_addr());

        Ok(Arc::new_cyclic(|me| Communicator {
            socket,
            router: Router::new(config.inbound_queue),
            config,
            sequence: SequenceCounter::new(),
            registry: Mutex::new(Registry::default()),
            dispatching: AtomicBool::new(false),
            me: me.clone(),
        }))
    }

    /// Address of the bound socket
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Active configuration
    pub fn config(&self) -> &RxpConfig {
        &self.config
    }

    /// Send a SYN to open a connection with `remote`
    pub fn send_syn(&self, remote: SocketAddr) -> Result<u32, CommunicatorError> {
        let seq = self.sequence.next();
        tracing::debug!("Sending SYN seq={} to {}", seq, remote);
        self.transmit(Packet::syn(self.local_addr(), remote, seq))?;
        Ok(seq)
    }

    /// Answer `syn`, acknowledging its sequence number with a fresh one of ours
    pub fn send_syn_ack(&self, syn: &Packet) -> Result<u32, CommunicatorError> {
        let ack = syn.sequence.ok_or(CommunicatorError::MissingSequence(syn.flags))?;
        let seq = self.sequence.next();
        tracing::debug!("Sending SYN+ACK seq={} ack={} to {}", seq, ack, syn.source);
        self.transmit(Packet::syn_ack(self.local_addr(), syn.source, seq, ack))?;
        Ok(seq)
    }

    /// Acknowledge `packet`
    pub fn send_ack(&self, packet: &Packet) -> Result<(), CommunicatorError> {
        let ack = packet
            .sequence
            .ok_or(CommunicatorError::MissingSequence(packet.flags))?;
        tracing::debug!("Sending ACK ack={} to {}", ack, packet.source);
        self.transmit(Packet::ack(self.local_addr(), packet.source, ack))
    }

    /// Send a FIN to close the connection with `remote`
    pub fn send_fin(&self, remote: SocketAddr) -> Result<u32, CommunicatorError> {
        let seq = self.sequence.next();
        tracing::debug!("Sending FIN seq={} to {}", seq, remote);
        self.transmit(Packet::fin(self.local_addr(), remote, seq))?;
        Ok(seq)
    }

    /// Send one DATA segment to `remote`
    pub fn send_data(&self, remote: SocketAddr, payload: Bytes) -> Result<u32, CommunicatorError> {
        let seq = self.sequence.next();
        tracing::trace!("Sending DATA seq={} len={} to {}", seq, payload.len(), remote);
        self.transmit(Packet::data(self.local_addr(), remote, seq, payload))?;
        Ok(seq)
    }

    fn transmit(&self, packet: Packet) -> Result<(), CommunicatorError> {
        let size = packet.encoded_len();
        if size > self.config.max_datagram_size {
            return Err(CommunicatorError::PacketTooLarge {
                size,
                max: self.config.max_datagram_size,
            });
        }

        let bytes = packet.to_bytes().freeze();
        let tracked = match packet.sequence {
            Some(seq) if packet.requires_ack() => {
                let mut registry = self.registry.lock();
                registry.entries.insert(
                    seq,
                    InFlight {
                        destination: packet.destination,
                        flags: packet.flags,
                        bytes: bytes.clone(),
                        sent_at: Instant::now(),
                        retransmissions: 0,
                    },
                );
                self.arm_sweep(&mut registry);
                Some(seq)
            }
            _ => None,
        };

        match (self.socket.send_to(&bytes, packet.destination), tracked) {
            (Ok(_), _) => Ok(()),
            // a tracked packet that failed to leave is lost; the sweep resends it
            (Err(e), Some(seq)) => {
                tracing::warn!(
                    "Send of {} seq={} to {} failed, will retransmit: {}",
                    packet.flags,
                    seq,
                    packet.destination,
                    e
                );
                Ok(())
            }
            (Err(e), None) => Err(e.into()),
        }
    }

    /// Read one datagram and validate it
    ///
    /// Returns `Ok(None)` when the read times out or the datagram is malformed
    /// or corrupt; those are logged and dropped here. An ACK removes the
    /// acknowledged packet from the registry before the packet is returned.
    pub fn receive_packet(&self) -> Result<Option<Packet>, CommunicatorError> {
        let mut buf = vec![0u8; self.config.max_datagram_size];
        let Some((n, from)) = self.socket.recv_from(&mut buf)? else {
            return Ok(None);
        };

        let mut packet = match Packet::from_bytes(&buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Malformed datagram from {}, dropping: {}", from, e);
                return Ok(None);
            }
        };
        if !packet.is_intact() {
            tracing::warn!("Corrupt packet detected from {}, dropping {}", from, packet);
            return Ok(None);
        }
        if packet.source.ip().is_unspecified() {
            packet.source.set_ip(from.ip());
        }

        tracing::debug!("Received {}", packet);

        if packet.flags.contains(Flags::ACK) {
            if let Some(ack) = packet.ack {
                self.acknowledge(ack, packet.source);
            }
        }
        Ok(Some(packet))
    }

    /// Drop `seq` from the registry if it was sent to `from`
    fn acknowledge(&self, seq: u32, from: SocketAddr) -> bool {
        let mut registry = self.registry.lock();
        match registry.entries.get(&seq) {
            Some(entry) if entry.destination == from => {
                let entry = registry.entries.remove(&seq);
                if let Some(entry) = entry {
                    tracing::debug!(
                        "{} seq={} acknowledged by {} after {} retransmissions",
                        entry.flags,
                        seq,
                        from,
                        entry.retransmissions
                    );
                }
                true
            }
            Some(entry) => {
                tracing::debug!(
                    "Ignoring ACK for seq={} from {}, it was sent to {}",
                    seq,
                    from,
                    entry.destination
                );
                false
            }
            None => {
                tracing::debug!("ACK for unknown seq={} from {}", seq, from);
                false
            }
        }
    }

    /// Stop tracking `seq` without an ACK; returns whether it was pending
    pub fn cancel(&self, seq: u32) -> bool {
        self.registry.lock().entries.remove(&seq).is_some()
    }

    /// Whether `seq` is still awaiting acknowledgement
    pub fn is_pending(&self, seq: u32) -> bool {
        self.registry.lock().entries.contains_key(&seq)
    }

    /// Number of packets awaiting acknowledgement
    pub fn pending_count(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// How many times `seq` has been resent, if it is still pending
    pub fn retransmissions(&self, seq: u32) -> Option<u32> {
        self.registry
            .lock()
            .entries
            .get(&seq)
            .map(|entry| entry.retransmissions)
    }

    fn arm_sweep(&self, registry: &mut Registry) {
        if registry.sweep_armed {
            return;
        }

        let weak = self.me.clone();
        let delay = self.config.retry_delay;
        let spawned = thread::Builder::new()
            .name(format!("rxp-retransmit-{}", self.local_addr()))
            .spawn(move || loop {
                thread::sleep(delay);
                let Some(communicator) = weak.upgrade() else {
                    return;
                };
                if !communicator.resend_stale() {
                    return;
                }
            });

        match spawned {
            Ok(_) => registry.sweep_armed = true,
            Err(e) => tracing::error!("{}", CommunicatorError::Spawn("retransmission", e)),
        }
    }

    /// Resend every packet older than the retry delay
    ///
    /// Returns false, disarming the sweep, once the registry is empty.
    fn resend_stale(&self) -> bool {
        let stale: Vec<(u32, Bytes, SocketAddr)> = {
            let mut registry = self.registry.lock();
            if registry.entries.is_empty() {
                registry.sweep_armed = false;
                tracing::debug!("No packets awaiting ACK, stopping retransmission sweep");
                return false;
            }

            let now = Instant::now();
            let retry_delay = self.config.retry_delay;
            registry
                .entries
                .iter_mut()
                .filter(|(_, entry)| now.duration_since(entry.sent_at) > retry_delay)
                .map(|(seq, entry)| {
                    entry.sent_at = now;
                    entry.retransmissions += 1;
                    (*seq, entry.bytes.clone(), entry.destination)
                })
                .collect()
        };

        for (seq, bytes, destination) in stale {
            tracing::debug!("Retransmitting seq={} to {}", seq, destination);
            if let Err(e) = self.socket.send_to(&bytes, destination) {
                tracing::warn!("Retransmission of seq={} failed: {}", seq, e);
            }
        }
        true
    }

    /// Start the single reader thread that routes inbound packets
    ///
    /// Calling it again is a no-op.
    pub fn start_dispatch(self: &Arc<Self>) -> Result<(), CommunicatorError> {
        if self.dispatching.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        dispatch::spawn_reader(self).map_err(|e| {
            self.dispatching.store(false, Ordering::Release);
            CommunicatorError::Spawn("reader", e)
        })
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    /// Open an inbox receiving every packet from `remote`
    pub fn register_route(&self, remote: SocketAddr) -> Receiver<Packet> {
        self.router.register(remote)
    }

    /// Stop routing packets from `remote`
    pub fn remove_route(&self, remote: SocketAddr) {
        self.router.remove(remote);
    }

    /// Hand `packet` to the connection registered for its source
    ///
    /// Returns false if there is none.
    pub fn deliver(&self, packet: Packet) -> bool {
        self.router.deliver(packet).is_ok()
    }

    /// Next packet no connection claimed, waiting at most `timeout`
    pub fn next_unrouted(&self, timeout: Duration) -> Option<Packet> {
        self.router.next_unrouted(timeout)
    }
}
