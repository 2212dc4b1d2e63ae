//! RxP Packet Structures and Serialization
//!
//! One RxP segment travels in exactly one UDP datagram. The layout is:
//!
//! ```text
//! flags:u8 | presence:u8 | [seq:u32] | [ack:u32] | source | destination | [len:u16 payload] | checksum:[u8; 32]
//! ```
//!
//! Endpoints are encoded as `family:u8 (4 or 6) | ip octets | port:u16`. Optional
//! fields are announced by the presence byte. All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ring::digest;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;

/// Length of the packet checksum (SHA-256 digest)
pub const CHECKSUM_LEN: usize = 32;

/// Default maximum datagram size read from the socket
pub const DEFAULT_MAX_DATAGRAM: usize = 512;

/// Largest header an IPv6 packet with every optional field can carry
pub const MAX_HEADER_SIZE: usize = 2 + 4 + 4 + 2 * ENDPOINT_V6_LEN + 2 + CHECKSUM_LEN;

const ENDPOINT_V4_LEN: usize = 1 + 4 + 2;
const ENDPOINT_V6_LEN: usize = 1 + 16 + 2;

/// Presence bits (second byte of the header)
const HAS_SEQUENCE: u8 = 1 << 0;
const HAS_ACK: u8 = 1 << 1;
const HAS_PAYLOAD: u8 = 1 << 2;
const PRESENCE_MASK: u8 = HAS_SEQUENCE | HAS_ACK | HAS_PAYLOAD;

/// Fixed-width packet digest
pub type Checksum = [u8; CHECKSUM_LEN];

/// Set of packet flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    /// Connection open
    pub const SYN: Flags = Flags(1 << 0);
    /// Acknowledgement
    pub const ACK: Flags = Flags(1 << 1);
    /// Connection close
    pub const FIN: Flags = Flags(1 << 2);
    /// Payload-carrying segment
    pub const DATA: Flags = Flags(1 << 3);
    /// Negative acknowledgement (reserved, never sent)
    pub const NACK: Flags = Flags(1 << 4);

    const MASK: u8 = 0x1F;

    /// Canonical order used for display and checksums
    const NAMED: [(Flags, &'static str); 5] = [
        (Flags::SYN, "SYN"),
        (Flags::ACK, "ACK"),
        (Flags::FIN, "FIN"),
        (Flags::DATA, "DATA"),
        (Flags::NACK, "NACK"),
    ];

    /// Empty flag set
    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Raw bit representation
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Parse from raw bits, rejecting undefined bits
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::MASK != 0 {
            None
        } else {
            Some(Flags(bits))
        }
    }

    /// Check whether every flag in `other` is set
    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether any flag in `other` is set
    #[inline]
    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    /// Names of the set flags, in canonical order
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMED
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
    }

    /// SYN, FIN and DATA segments must be acknowledged by the peer
    #[inline]
    pub fn requires_ack(self) -> bool {
        self.intersects(Flags::SYN | Flags::FIN | Flags::DATA)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({})", self)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "NONE");
        }
        let mut first = true;
        for name in self.names() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{}", name)?;
            first = false;
        }
        Ok(())
    }
}

/// A single RxP segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet flags
    pub flags: Flags,
    /// Sequence number (absent on pure ACKs)
    pub sequence: Option<u32>,
    /// Sequence number being acknowledged
    pub ack: Option<u32>,
    /// Payload, present only on DATA packets
    pub payload: Option<Bytes>,
    /// Sending endpoint
    pub source: SocketAddr,
    /// Receiving endpoint
    pub destination: SocketAddr,
    /// Digest over every field above
    pub checksum: Checksum,
}

impl Packet {
    /// Build a packet and seal it with its checksum
    pub fn new(
        flags: Flags,
        sequence: Option<u32>,
        ack: Option<u32>,
        payload: Option<Bytes>,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        let mut packet = Packet {
            flags,
            sequence,
            ack,
            payload,
            source,
            destination,
            checksum: [0; CHECKSUM_LEN],
        };
        packet.seal();
        packet
    }

    /// Connection request
    pub fn syn(source: SocketAddr, destination: SocketAddr, sequence: u32) -> Self {
        Packet::new(Flags::SYN, Some(sequence), None, None, source, destination)
    }

    /// Reply to a connection request, acknowledging the peer's SYN
    pub fn syn_ack(source: SocketAddr, destination: SocketAddr, sequence: u32, ack: u32) -> Self {
        Packet::new(
            Flags::SYN | Flags::ACK,
            Some(sequence),
            Some(ack),
            None,
            source,
            destination,
        )
    }

    /// Pure acknowledgement
    pub fn ack(source: SocketAddr, destination: SocketAddr, ack: u32) -> Self {
        Packet::new(Flags::ACK, None, Some(ack), None, source, destination)
    }

    /// Connection close request
    pub fn fin(source: SocketAddr, destination: SocketAddr, sequence: u32) -> Self {
        Packet::new(Flags::FIN, Some(sequence), None, None, source, destination)
    }

    /// Payload-carrying segment
    pub fn data(source: SocketAddr, destination: SocketAddr, sequence: u32, payload: Bytes) -> Self {
        Packet::new(
            Flags::DATA,
            Some(sequence),
            None,
            Some(payload),
            source,
            destination,
        )
    }

    /// Recompute and store the checksum
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Compute the digest over flags, sequence, ack, payload and both endpoints
    pub fn compute_checksum(&self) -> Checksum {
        let mut ctx = digest::Context::new(&digest::SHA256);

        for name in self.flags.names() {
            ctx.update(name.as_bytes());
        }
        if let Some(seq) = self.sequence {
            ctx.update(b"seq");
            ctx.update(&seq.to_be_bytes());
        }
        if let Some(ack) = self.ack {
            ctx.update(b"ack");
            ctx.update(&ack.to_be_bytes());
        }
        if let Some(payload) = &self.payload {
            ctx.update(b"data");
            ctx.update(payload);
        }
        ctx.update(self.source.to_string().as_bytes());
        ctx.update(b">");
        ctx.update(self.destination.to_string().as_bytes());

        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(ctx.finish().as_ref());
        checksum
    }

    /// True when the stored checksum matches the packet contents
    pub fn is_intact(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Whether the peer must acknowledge this packet
    #[inline]
    pub fn requires_ack(&self) -> bool {
        self.flags.requires_ack()
    }

    /// Payload length (zero when absent)
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    /// Size of the encoded packet in bytes
    pub fn encoded_len(&self) -> usize {
        let mut len = 2 + CHECKSUM_LEN;
        if self.sequence.is_some() {
            len += 4;
        }
        if self.ack.is_some() {
            len += 4;
        }
        len += endpoint_len(&self.source) + endpoint_len(&self.destination);
        if let Some(payload) = &self.payload {
            len += 2 + payload.len();
        }
        len
    }

    /// Serialize the packet (network byte order)
    ///
    /// Payloads longer than `u16::MAX` cannot be represented; callers bound the
    /// payload by the datagram size before building the packet.
    pub fn to_bytes(&self) -> BytesMut {
        debug_assert!(self.payload_len() <= u16::MAX as usize);

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        let mut presence = 0u8;
        if self.sequence.is_some() {
            presence |= HAS_SEQUENCE;
        }
        if self.ack.is_some() {
            presence |= HAS_ACK;
        }
        if self.payload.is_some() {
            presence |= HAS_PAYLOAD;
        }

        buf.put_u8(self.flags.bits());
        buf.put_u8(presence);
        if let Some(seq) = self.sequence {
            buf.put_u32(seq);
        }
        if let Some(ack) = self.ack {
            buf.put_u32(ack);
        }
        put_endpoint(&mut buf, &self.source);
        put_endpoint(&mut buf, &self.destination);
        if let Some(payload) = &self.payload {
            buf.put_u16(payload.len() as u16);
            buf.put_slice(payload);
        }
        buf.put_slice(&self.checksum);
        buf
    }

    /// Parse a packet from bytes
    ///
    /// The stored checksum is read but not verified; see [`Packet::is_intact`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut buf = bytes;

        need(buf, 2)?;
        let raw_flags = buf.get_u8();
        let flags = Flags::from_bits(raw_flags).ok_or(PacketError::UnknownFlags(raw_flags))?;
        let presence = buf.get_u8();
        if presence & !PRESENCE_MASK != 0 {
            return Err(PacketError::InvalidPresence(presence));
        }

        let sequence = if presence & HAS_SEQUENCE != 0 {
            need(buf, 4)?;
            Some(buf.get_u32())
        } else {
            None
        };
        let ack = if presence & HAS_ACK != 0 {
            need(buf, 4)?;
            Some(buf.get_u32())
        } else {
            None
        };

        let source = get_endpoint(&mut buf)?;
        let destination = get_endpoint(&mut buf)?;

        let payload = if presence & HAS_PAYLOAD != 0 {
            need(buf, 2)?;
            let len = buf.get_u16() as usize;
            need(buf, len)?;
            let payload = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len);
            Some(payload)
        } else {
            None
        };

        need(buf, CHECKSUM_LEN)?;
        if buf.len() != CHECKSUM_LEN {
            return Err(PacketError::TrailingBytes(buf.len() - CHECKSUM_LEN));
        }
        let mut checksum = [0u8; CHECKSUM_LEN];
        buf.copy_to_slice(&mut checksum);

        Ok(Packet {
            flags,
            sequence,
            ack,
            payload,
            source,
            destination,
            checksum,
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.flags)?;
        if let Some(seq) = self.sequence {
            write!(f, " seq={}", seq)?;
        }
        if let Some(ack) = self.ack {
            write!(f, " ack={}", ack)?;
        }
        if let Some(payload) = &self.payload {
            write!(f, " len={}", payload.len())?;
        }
        write!(f, " {} -> {}]", self.source, self.destination)
    }
}

fn endpoint_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => ENDPOINT_V4_LEN,
        SocketAddr::V6(_) => ENDPOINT_V6_LEN,
    }
}

fn put_endpoint(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn get_endpoint(buf: &mut &[u8]) -> Result<SocketAddr, PacketError> {
    need(buf, 1)?;
    let ip = match buf.get_u8() {
        4 => {
            need(buf, 4 + 2)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            need(buf, 16 + 2)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(PacketError::InvalidAddressFamily(other)),
    };
    Ok(SocketAddr::new(ip, buf.get_u16()))
}

#[inline]
fn need(buf: &[u8], expected: usize) -> Result<(), PacketError> {
    if buf.len() < expected {
        Err(PacketError::InsufficientData {
            expected,
            actual: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Packet parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unknown flag bits: {0:#04x}")]
    UnknownFlags(u8),

    #[error("Invalid presence byte: {0:#04x}")]
    InvalidPresence(u8),

    #[error("Invalid address family: {0}")]
    InvalidAddressFamily(u8),

    #[error("{0} unexpected bytes before checksum")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "127.0.0.1:50001".parse().unwrap()
    }

    fn server() -> SocketAddr {
        "127.0.0.1:50002".parse().unwrap()
    }

    #[test]
    fn test_flags() {
        let flags = Flags::SYN | Flags::ACK;
        assert!(flags.contains(Flags::SYN));
        assert!(flags.contains(Flags::ACK));
        assert!(!flags.contains(Flags::FIN));
        assert_eq!(flags.names().collect::<Vec<_>>(), vec!["SYN", "ACK"]);
        assert_eq!(flags.to_string(), "SYN|ACK");
        assert_eq!(Flags::empty().to_string(), "NONE");
        assert!(Flags::from_bits(0x20).is_none());
    }

    #[test]
    fn test_requires_ack() {
        assert!(Packet::syn(client(), server(), 1).requires_ack());
        assert!(Packet::syn_ack(server(), client(), 1, 1).requires_ack());
        assert!(Packet::fin(client(), server(), 2).requires_ack());
        assert!(Packet::data(client(), server(), 3, Bytes::from_static(b"x")).requires_ack());
        assert!(!Packet::ack(client(), server(), 3).requires_ack());
    }

    #[test]
    fn test_data_packet_serialization() {
        let packet = Packet::data(client(), server(), 42, Bytes::from_static(b"Hello, RxP!"));
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), packet.encoded_len());

        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.is_intact());
        assert_eq!(decoded.compute_checksum(), packet.checksum);
    }

    #[test]
    fn test_pure_ack_has_no_sequence() {
        let packet = Packet::ack(server(), client(), 7);
        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded.sequence, None);
        assert_eq!(decoded.ack, Some(7));
        assert_eq!(decoded.payload, None);
    }

    #[test]
    fn test_ipv6_endpoints() {
        let source: SocketAddr = "[::1]:9000".parse().unwrap();
        let destination: SocketAddr = "[fe80::1]:9001".parse().unwrap();
        let packet = Packet::fin(source, destination, 9);
        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded.source, source);
        assert_eq!(decoded.destination, destination);
        assert!(decoded.is_intact());
    }

    #[test]
    fn test_empty_payload_differs_from_absent() {
        let mut with_empty = Packet::ack(client(), server(), 1);
        with_empty.payload = Some(Bytes::new());
        with_empty.seal();
        let without = Packet::ack(client(), server(), 1);

        assert_ne!(with_empty.checksum, without.checksum);
        assert_ne!(with_empty.to_bytes(), without.to_bytes());
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut packet = Packet::data(client(), server(), 5, Bytes::from_static(b"abc"));
        packet.payload = Some(Bytes::from_static(b"abd"));
        assert!(!packet.is_intact());

        let mut packet = Packet::syn(client(), server(), 1);
        packet.destination = "127.0.0.1:50003".parse().unwrap();
        assert!(!packet.is_intact());
    }

    #[test]
    fn test_truncated_packet() {
        let bytes = Packet::syn(client(), server(), 1).to_bytes();
        let err = Packet::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, PacketError::InsufficientData { .. }));
        assert!(Packet::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Packet::syn(client(), server(), 1).to_bytes();
        bytes.put_u8(0);
        assert_eq!(
            Packet::from_bytes(&bytes).unwrap_err(),
            PacketError::TrailingBytes(1)
        );
    }

    #[test]
    fn test_invalid_headers() {
        let mut bytes = Packet::syn(client(), server(), 1).to_bytes();
        bytes[0] = 0x80;
        assert_eq!(
            Packet::from_bytes(&bytes).unwrap_err(),
            PacketError::UnknownFlags(0x80)
        );

        let mut bytes = Packet::syn(client(), server(), 1).to_bytes();
        bytes[1] = 0x08;
        assert_eq!(
            Packet::from_bytes(&bytes).unwrap_err(),
            PacketError::InvalidPresence(0x08)
        );

        // family byte of the source endpoint follows flags, presence and seq
        let mut bytes = Packet::syn(client(), server(), 1).to_bytes();
        bytes[6] = 5;
        assert_eq!(
            Packet::from_bytes(&bytes).unwrap_err(),
            PacketError::InvalidAddressFamily(5)
        );
    }

    #[test]
    fn test_display() {
        let packet = Packet::syn_ack(server(), client(), 3, 1);
        assert_eq!(
            packet.to_string(),
            "[SYN|ACK seq=3 ack=1 127.0.0.1:50002 -> 127.0.0.1:50001]"
        );
    }
}
