//! RxP Connection
//!
//! One virtual circuit to a remote endpoint. A connection owns its send
//! window, outbound cursor and receive buffer, and runs a receive loop on its
//! own thread that feeds every routed packet through the state machine in
//! [`rxp_protocol::state`]. Close states arm timers on short-lived threads.
//!
//! `Connection` is a cheap handle; clones share the same circuit.

use crate::communicator::{Communicator, CommunicatorError};
use bytes::{Bytes, BytesMut};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex, RwLock};
use rxp_protocol::{
    Action, ConnectionState, Event, Flags, Outbound, Packet, ReceiveBuffer, SendWindow, Transition,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection is {0}, not ESTABLISHED")]
    NotEstablished(ConnectionState),

    #[error("Connection has no communicator")]
    Detached,

    #[error("Window size must be greater than zero")]
    InvalidWindowSize,

    #[error("No data received within {0:?}")]
    ReceiveTimeout(Duration),

    #[error("Communicator error: {0}")]
    Communicator(#[from] CommunicatorError),
}

/// State guarded by the connection mutex
struct Core {
    state: ConnectionState,
    last_seq: Option<u32>,
    last_ack: Option<u32>,
    window: SendWindow,
    outbound: Outbound,
    received: ReceiveBuffer,
    fin_seq: Option<u32>,
    close_rearms: u32,
}

struct Inner {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    communicator: RwLock<Option<Arc<Communicator>>>,
    core: Mutex<Core>,
    readable: Condvar,
}

/// RxP connection handle
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection in INITIATED
    ///
    /// `last_seq` and `last_ack` are the sequence numbers exchanged so far in
    /// the handshake.
    pub(crate) fn new(
        communicator: Arc<Communicator>,
        remote_addr: SocketAddr,
        window_size: usize,
        last_seq: Option<u32>,
        last_ack: Option<u32>,
    ) -> Result<Self, ConnectionError> {
        if window_size == 0 {
            return Err(ConnectionError::InvalidWindowSize);
        }

        Ok(Connection {
            inner: Arc::new(Inner {
                local_addr: communicator.local_addr(),
                remote_addr,
                communicator: RwLock::new(Some(communicator)),
                core: Mutex::new(Core {
                    state: ConnectionState::Initiated,
                    last_seq,
                    last_ack,
                    window: SendWindow::new(window_size),
                    outbound: Outbound::new(),
                    received: ReceiveBuffer::new(),
                    fin_seq: None,
                    close_rearms: 0,
                }),
                readable: Condvar::new(),
            }),
        })
    }

    /// Complete the handshake and start the receive loop
    ///
    /// The route for the remote endpoint is registered before this returns,
    /// so every packet read afterwards reaches the loop.
    pub(crate) fn establish(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let communicator = inner.communicator().ok_or(ConnectionError::Detached)?;
        let mut core = inner.core.lock();

        let transition = inner.apply(&mut core, &communicator, Event::HandshakeComplete, None)?;
        if transition.action == Action::StartReceiving {
            let inbox = communicator.register_route(inner.remote_addr);
            let poll = communicator.config().poll_interval;
            let loop_inner = Arc::clone(inner);
            thread::Builder::new()
                .name(format!("rxp-conn-{}", inner.remote_addr))
                .spawn(move || run(loop_inner, inbox, poll))
                .map_err(|e| CommunicatorError::Spawn("receive", e))?;

            tracing::info!(
                "Connection established: {} <-> {}",
                inner.local_addr,
                inner.remote_addr
            );
        }
        Ok(())
    }

    /// Queue `command` followed by `data` and start sending it
    pub fn send(&self, command: &str, data: Option<&[u8]>) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.state != ConnectionState::Established {
            return Err(ConnectionError::NotEstablished(core.state));
        }
        let communicator = inner.communicator().ok_or(ConnectionError::Detached)?;

        let data = data.unwrap_or_default();
        let mut bytes = BytesMut::with_capacity(command.len() + data.len());
        bytes.extend_from_slice(command.as_bytes());
        bytes.extend_from_slice(data);
        core.outbound.enqueue(&bytes);

        let sent = inner.fill(&mut core, &communicator)?;
        tracing::debug!(
            "Queued {} bytes for {}, {} segments sent",
            bytes.len(),
            inner.remote_addr,
            sent
        );
        Ok(())
    }

    /// Take up to `max` received bytes
    ///
    /// Blocks while nothing is buffered and the connection is ESTABLISHED.
    /// An empty result means the connection has left ESTABLISHED.
    pub fn receive(&self, max: usize) -> Bytes {
        let mut core = self.inner.core.lock();
        while core.received.is_empty() && core.state == ConnectionState::Established {
            self.inner.readable.wait(&mut core);
        }
        core.received.take(max)
    }

    /// Like [`Connection::receive`], giving up after `timeout`
    pub fn receive_timeout(&self, max: usize, timeout: Duration) -> Result<Bytes, ConnectionError> {
        let deadline = Instant::now() + timeout;
        let mut core = self.inner.core.lock();
        while core.received.is_empty() && core.state == ConnectionState::Established {
            if self
                .inner
                .readable
                .wait_until(&mut core, deadline)
                .timed_out()
            {
                if core.received.is_empty() && core.state == ConnectionState::Established {
                    return Err(ConnectionError::ReceiveTimeout(timeout));
                }
                break;
            }
        }
        Ok(core.received.take(max))
    }

    /// Begin the close handshake; does not wait for it to finish
    pub fn close(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let Some(communicator) = inner.communicator() else {
            return Ok(());
        };
        let mut core = inner.core.lock();
        inner.apply(&mut core, &communicator, Event::LocalClose, None)?;
        Ok(())
    }

    /// Release everything and move to CLOSED; safe to call repeatedly
    pub fn destroy(&self) {
        let mut core = self.inner.core.lock();
        self.inner.teardown(&mut core);
    }

    /// Resize the send window, refilling it if the connection is ESTABLISHED
    pub fn set_window_size(&self, size: usize) -> Result<(), ConnectionError> {
        if size == 0 {
            return Err(ConnectionError::InvalidWindowSize);
        }
        let inner = &self.inner;
        let mut core = inner.core.lock();
        core.window.resize(size);
        tracing::debug!("Window for {} resized to {}", inner.remote_addr, size);

        if core.state == ConnectionState::Established {
            if let Some(communicator) = inner.communicator() {
                inner.fill(&mut core, &communicator)?;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Configured number of window slots
    pub fn window_size(&self) -> usize {
        self.inner.core.lock().window.size()
    }

    /// Snapshot of the window slots
    pub fn send_window(&self) -> Vec<Option<u32>> {
        self.inner.core.lock().window.slots().to_vec()
    }

    /// Most recent sequence number sent on this circuit
    pub fn last_seq(&self) -> Option<u32> {
        self.inner.core.lock().last_seq
    }

    /// Most recent sequence number acknowledged to the peer
    pub fn last_ack(&self) -> Option<u32> {
        self.inner.core.lock().last_ack
    }

    /// Bytes waiting to be read
    pub fn buffered(&self) -> usize {
        self.inner.core.lock().received.len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn communicator(&self) -> Option<Arc<Communicator>> {
        self.communicator.read().clone()
    }

    /// Feed `event` through the state machine and carry out its action
    fn apply(
        self: &Arc<Self>,
        core: &mut Core,
        communicator: &Communicator,
        event: Event,
        trigger: Option<&Packet>,
    ) -> Result<Transition, ConnectionError> {
        let from = core.state;
        let transition = from.on_event(event);
        if transition.next != from {
            tracing::debug!(
                "{}: {} -> {} on {:?}",
                self.remote_addr,
                from,
                transition.next,
                event
            );
            core.state = transition.next;
            core.close_rearms = 0;
            // blocked readers re-check the state
            self.readable.notify_all();
        }

        let acked = trigger.and_then(|packet| packet.ack);
        match transition.action {
            Action::Nothing | Action::StartReceiving => {}
            Action::AdvanceWindow => {
                if let Some(seq) = acked {
                    core.window.acknowledge(seq);
                }
                self.fill(core, communicator)?;
            }
            Action::ReleaseSlot => {
                if let Some(seq) = acked {
                    core.window.acknowledge(seq);
                }
            }
            Action::SendFin => {
                let seq = communicator.send_fin(self.remote_addr)?;
                core.fin_seq = Some(seq);
                core.last_seq = Some(seq);
                self.arm_close_timer(transition.next, communicator.config().close_timeout);
            }
            Action::AckFin => self.acknowledge(core, communicator, trigger)?,
            Action::AckFinThenClose => {
                self.acknowledge(core, communicator, trigger)?;
                return self.apply(core, communicator, Event::LocalClose, None);
            }
            Action::AckFinAndArm => {
                self.acknowledge(core, communicator, trigger)?;
                self.arm_close_timer(transition.next, communicator.config().close_timeout);
            }
            Action::AckFinThenDestroy => {
                self.acknowledge(core, communicator, trigger)?;
                self.teardown(core);
            }
            Action::ArmTimeout => {
                self.arm_close_timer(transition.next, communicator.config().close_timeout);
            }
            Action::Destroy => self.teardown(core),
        }
        Ok(transition)
    }

    fn acknowledge(
        &self,
        core: &mut Core,
        communicator: &Communicator,
        packet: Option<&Packet>,
    ) -> Result<(), ConnectionError> {
        if let Some(packet) = packet {
            communicator.send_ack(packet)?;
            core.last_ack = packet.sequence;
        }
        Ok(())
    }

    /// Send from the outbound buffer into every free window slot
    fn fill(&self, core: &mut Core, communicator: &Communicator) -> Result<usize, ConnectionError> {
        let Core {
            window,
            outbound,
            last_seq,
            ..
        } = core;
        let remote = self.remote_addr;
        let segment_size = communicator.config().send_buffer_size;

        let sent = window.fill(
            outbound,
            segment_size,
            |segment| -> Result<u32, CommunicatorError> {
                let seq = communicator.send_data(remote, segment)?;
                *last_seq = Some(seq);
                Ok(seq)
            },
        )?;
        Ok(sent)
    }

    /// Dispatch one routed packet: ACK, then FIN, then DATA, then SYN
    fn handle(self: &Arc<Self>, packet: &Packet) -> Result<(), ConnectionError> {
        let Some(communicator) = self.communicator() else {
            return Ok(());
        };
        let mut core = self.core.lock();

        if packet.flags.contains(Flags::ACK) {
            if let Some(ack) = packet.ack {
                let acks_fin = core.fin_seq == Some(ack);
                self.apply(&mut core, &communicator, Event::Ack { acks_fin }, Some(packet))?;
            }
        }

        if packet.flags.contains(Flags::FIN) {
            self.apply(&mut core, &communicator, Event::Fin, Some(packet))?;
        }

        if packet.flags.contains(Flags::DATA) && core.state != ConnectionState::Closed {
            if let (Some(seq), Some(payload)) = (packet.sequence, packet.payload.as_ref()) {
                if core.received.push(seq, payload) {
                    self.readable.notify_all();
                } else {
                    tracing::debug!("Duplicate DATA seq={} from {}", seq, self.remote_addr);
                }
                self.acknowledge(&mut core, &communicator, Some(packet))?;
            }
        }

        // a retransmitted SYN or SYN+ACK means our handshake ACK was lost
        if packet.flags.contains(Flags::SYN) && core.state != ConnectionState::Closed {
            self.acknowledge(&mut core, &communicator, Some(packet))?;
        }
        Ok(())
    }

    fn arm_close_timer(self: &Arc<Self>, armed_in: ConnectionState, delay: Duration) {
        let weak = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(format!("rxp-close-{}", self.remote_addr))
            .spawn(move || {
                thread::sleep(delay);
                if let Some(inner) = weak.upgrade() {
                    inner.on_close_timeout(armed_in);
                }
            });

        match spawned {
            Ok(_) => tracing::debug!("{}: {} timer armed", self.remote_addr, armed_in),
            Err(e) => tracing::error!(
                "{}",
                CommunicatorError::Spawn("close timer", e)
            ),
        }
    }

    fn on_close_timeout(self: &Arc<Self>, armed_in: ConnectionState) {
        let Some(communicator) = self.communicator() else {
            return;
        };
        let mut core = self.core.lock();

        let fin_pending = core
            .fin_seq
            .map_or(false, |seq| communicator.is_pending(seq));
        let exhausted = core.close_rearms >= communicator.config().close_rearm_limit;
        if fin_pending && exhausted && core.state == armed_in {
            tracing::warn!(
                "{}: FIN still unacknowledged in {}, closing anyway",
                self.remote_addr,
                armed_in
            );
        }

        let event = Event::CloseTimeout {
            armed_in,
            fin_pending: fin_pending && !exhausted,
        };
        match self.apply(&mut core, &communicator, event, None) {
            Ok(transition) if transition.action == Action::ArmTimeout => core.close_rearms += 1,
            Ok(_) => {}
            Err(e) => tracing::warn!("{}: close timeout failed: {}", self.remote_addr, e),
        }
    }

    /// Move to CLOSED and release every resource
    fn teardown(&self, core: &mut Core) {
        if let Some(communicator) = self.communicator.write().take() {
            communicator.remove_route(self.remote_addr);
            let outstanding = core
                .fin_seq
                .into_iter()
                .chain(core.window.slots().iter().flatten().copied());
            for seq in outstanding {
                communicator.cancel(seq);
            }
            tracing::info!(
                "Connection closed: {} <-> {}",
                self.local_addr,
                self.remote_addr
            );
        }

        core.state = ConnectionState::Closed;
        core.received.clear();
        core.window.clear();
        core.outbound.clear();
        self.readable.notify_all();
    }
}

/// Receive loop: runs until the connection closes or loses its route
fn run(inner: Arc<Inner>, inbox: Receiver<Packet>, poll: Duration) {
    loop {
        match inbox.recv_timeout(poll) {
            Ok(packet) => {
                if let Err(e) = inner.handle(&packet) {
                    tracing::warn!("Failed to handle {}: {}", packet, e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if inner.core.lock().state == ConnectionState::Closed || inner.communicator.read().is_none()
        {
            break;
        }
    }
    tracing::debug!("Receive loop for {} exiting", inner.remote_addr);
}
