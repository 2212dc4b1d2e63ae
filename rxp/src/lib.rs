//! RxP - Reliable transport over UDP
//!
//! A connection-oriented byte stream with a three-way handshake, a fixed-size
//! sliding send window, timer-driven retransmission and a FIN/ACK teardown.
//!
//! ```no_run
//! use rxp::{Listener, RxpConfig};
//!
//! # fn main() -> Result<(), rxp::ListenerError> {
//! let listener = Listener::listen("127.0.0.1:9000".parse().unwrap(), RxpConfig::default())?;
//! let connection = listener.accept()?;
//! let request = connection.receive(512);
//! connection.send("echo ", Some(&request[..]))?;
//! connection.close()?;
//! # Ok(())
//! # }
//! ```

pub mod communicator;
pub mod config;
pub mod connection;
mod dispatch;
pub mod listener;

pub use rxp_io as io;
pub use rxp_protocol as protocol;

pub use communicator::{Communicator, CommunicatorError};
pub use config::{ConfigError, RxpConfig};
pub use connection::{Connection, ConnectionError};
pub use listener::{Listener, ListenerError};
pub use protocol::{ConnectionState, Flags, Packet};
