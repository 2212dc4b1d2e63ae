//! RxP I/O
//!
//! Datagram socket wrapper used by the RxP engine.

pub mod socket;

pub use socket::{is_timeout, RxpSocket, SocketError};
