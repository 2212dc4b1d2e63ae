//! Connection State Machine
//!
//! The lifecycle of an RxP connection, from handshake through data transfer to
//! the FIN/ACK teardown, is a pure function of (state, event). The connection
//! layer feeds events in and performs the returned [`Action`]; no I/O happens
//! here.
//!
//! ```text
//! INITIATED ──handshake──▶ ESTABLISHED ──close──▶ FIN_WAIT_1 ──ACK(fin)──▶ FIN_WAIT_2
//!                               │                     │                      │
//!                            FIN rcvd              FIN rcvd               FIN rcvd
//!                               ▼                     ▼                      ▼
//!                          CLOSE_WAIT             CLOSING ──ACK(fin)──▶   CLOSED
//!                               │ (auto close)                              ▲
//!                               ▼                                           │
//!                           LAST_ACK ─────────────ACK(fin)──────────────────┘
//! ```
//!
//! Every close state also falls through to CLOSED when its timer fires while
//! the state is unchanged and the local FIN is no longer awaiting an ACK.

use std::fmt;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Created, handshake not yet complete
    #[default]
    Initiated,
    /// Handshake complete, data transfer allowed
    Established,
    /// Local FIN sent, waiting for its ACK
    FinWait1,
    /// Local FIN acknowledged, waiting for the peer's FIN
    FinWait2,
    /// Both sides sent FIN, waiting for the ACK of ours
    Closing,
    /// Peer's FIN received, local close pending
    CloseWait,
    /// Local FIN sent after the peer's, waiting for its ACK
    LastAck,
    /// Terminal state
    Closed,
}

impl ConnectionState {
    /// States that arm a close timer on entry
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConnectionState::FinWait1
                | ConnectionState::FinWait2
                | ConnectionState::Closing
                | ConnectionState::CloseWait
                | ConnectionState::LastAck
        )
    }

    /// Feed one event through the state machine
    pub fn on_event(self, event: Event) -> Transition {
        use ConnectionState::*;

        let (next, action) = match (self, event) {
            (Initiated, Event::HandshakeComplete) => (Established, Action::StartReceiving),
            (Initiated, _) => (Initiated, Action::Nothing),

            (Established, Event::LocalClose) => (FinWait1, Action::SendFin),
            (Established, Event::Fin) => (CloseWait, Action::AckFinThenClose),
            (Established, Event::Ack { .. }) => (Established, Action::AdvanceWindow),
            (Established, Event::HandshakeComplete | Event::CloseTimeout { .. }) => {
                (Established, Action::Nothing)
            }

            (FinWait1, Event::Ack { acks_fin: true }) => (FinWait2, Action::ArmTimeout),
            (FinWait1, Event::Fin) => (Closing, Action::AckFinAndArm),

            (FinWait2, Event::Fin) => (Closed, Action::AckFinThenDestroy),

            (Closing, Event::Ack { acks_fin: true }) => (Closed, Action::Destroy),
            (Closing, Event::Fin) => (Closing, Action::AckFin),

            (CloseWait, Event::LocalClose) => (LastAck, Action::SendFin),
            (CloseWait, Event::Fin) => (CloseWait, Action::AckFin),
            (CloseWait, Event::Ack { .. }) => (CloseWait, Action::ReleaseSlot),

            (LastAck, Event::Ack { acks_fin: true }) => (Closed, Action::Destroy),
            (LastAck, Event::Fin) => (LastAck, Action::AckFin),

            (
                state @ (FinWait1 | FinWait2 | Closing | LastAck),
                Event::Ack { acks_fin: false },
            ) => (state, Action::ReleaseSlot),
            (FinWait2, Event::Ack { acks_fin: true }) => (FinWait2, Action::Nothing),

            (
                state @ (FinWait1 | FinWait2 | Closing | CloseWait | LastAck),
                Event::CloseTimeout {
                    armed_in,
                    fin_pending,
                },
            ) => {
                if armed_in != state {
                    (state, Action::Nothing)
                } else if fin_pending {
                    (state, Action::ArmTimeout)
                } else {
                    (Closed, Action::Destroy)
                }
            }

            (
                state @ (FinWait1 | FinWait2 | Closing | LastAck),
                Event::LocalClose | Event::HandshakeComplete,
            ) => (state, Action::Nothing),
            (CloseWait, Event::HandshakeComplete) => (CloseWait, Action::Nothing),

            (Closed, _) => (Closed, Action::Nothing),
        };

        Transition { next, action }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initiated => "INITIATED",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait1 => "FIN_WAIT_1",
            ConnectionState::FinWait2 => "FIN_WAIT_2",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::LastAck => "LAST_ACK",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Three-way handshake finished
    HandshakeComplete,
    /// Application called `close()`
    LocalClose,
    /// ACK received; `acks_fin` is set when it acknowledges our FIN
    Ack { acks_fin: bool },
    /// Peer's FIN received
    Fin,
    /// A close timer armed in `armed_in` fired
    CloseTimeout {
        armed_in: ConnectionState,
        fin_pending: bool,
    },
}

/// Side effect the connection must carry out after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No side effect
    Nothing,
    /// Start the receive loop
    StartReceiving,
    /// Clear the acknowledged window slot and refill the window
    AdvanceWindow,
    /// Clear the acknowledged window slot without sending more data
    ReleaseSlot,
    /// Send a FIN and arm the close timer for the new state
    SendFin,
    /// Acknowledge the peer's FIN
    AckFin,
    /// Acknowledge the peer's FIN, then close locally
    AckFinThenClose,
    /// Acknowledge the peer's FIN and arm the close timer
    AckFinAndArm,
    /// Acknowledge the peer's FIN and tear down
    AckFinThenDestroy,
    /// Arm the close timer for the new state
    ArmTimeout,
    /// Tear down
    Destroy,
}

/// Result of feeding an event to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub action: Action,
}
