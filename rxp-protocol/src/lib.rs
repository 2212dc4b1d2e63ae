//! RxP Protocol Core
//!
//! Socket-free building blocks of the RxP reliable transport: the wire packet
//! format and checksum, per-socket sequence allocation, the connection state
//! machine, the send window and the receive buffer.

pub mod buffer;
pub mod packet;
pub mod sequence;
pub mod state;
pub mod window;

pub use buffer::ReceiveBuffer;
pub use packet::{Checksum, Flags, Packet, PacketError, CHECKSUM_LEN};
pub use sequence::SequenceCounter;
pub use state::{Action, ConnectionState, Event, Transition};
pub use window::{Outbound, SendWindow};
