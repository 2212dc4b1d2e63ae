//! Property-based tests for the RxP wire format and send window
//!
//! These tests use proptest to generate random packets and verify that
//! serialization, checksums and window filling hold for all valid inputs.

use bytes::Bytes;
use proptest::prelude::*;
use rxp_protocol::packet::{Flags, Packet};
use rxp_protocol::{Outbound, ReceiveBuffer, SendWindow};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// Property test strategies

fn flags_strategy() -> impl Strategy<Value = Flags> {
    (0u8..=0x1F).prop_map(|bits| Flags::from_bits(bits).unwrap())
}

fn endpoint_strategy() -> impl Strategy<Value = SocketAddr> {
    prop_oneof![
        (any::<[u8; 4]>(), any::<u16>())
            .prop_map(|(ip, port)| SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)),
        (any::<[u8; 16]>(), any::<u16>())
            .prop_map(|(ip, port)| SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)),
    ]
}

fn small_payload_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=256).prop_map(Bytes::from)
}

fn packet_strategy() -> impl Strategy<Value = Packet> {
    (
        flags_strategy(),
        proptest::option::of(any::<u32>()),
        proptest::option::of(any::<u32>()),
        proptest::option::of(small_payload_strategy()),
        endpoint_strategy(),
        endpoint_strategy(),
    )
        .prop_map(|(flags, sequence, ack, payload, source, destination)| {
            Packet::new(flags, sequence, ack, payload, source, destination)
        })
}

// Property tests

proptest! {
    #[test]
    fn prop_packet_roundtrip(packet in packet_strategy()) {
        let serialized = packet.to_bytes();
        prop_assert_eq!(serialized.len(), packet.encoded_len());

        let deserialized = Packet::from_bytes(&serialized).unwrap();
        prop_assert_eq!(&deserialized, &packet);
        prop_assert!(deserialized.is_intact());
    }

    #[test]
    fn prop_checksum_survives_roundtrip(packet in packet_strategy()) {
        let deserialized = Packet::from_bytes(&packet.to_bytes()).unwrap();
        prop_assert_eq!(deserialized.compute_checksum(), packet.compute_checksum());
    }

    #[test]
    fn prop_single_bit_flip_detected(packet in packet_strategy(), bit in any::<prop::sample::Index>()) {
        let mut serialized = packet.to_bytes();
        let bit = bit.index(serialized.len() * 8);
        serialized[bit / 8] ^= 1 << (bit % 8);

        match Packet::from_bytes(&serialized) {
            Ok(mutated) => prop_assert!(!mutated.is_intact()),
            Err(_) => {}
        }
    }

    #[test]
    fn prop_window_fill_count(
        window in 1usize..=32,
        segment in 1usize..=16,
        len in 0usize..=200,
    ) {
        let mut send_window = SendWindow::new(window);
        let mut outbound = Outbound::new();
        outbound.enqueue(&vec![b'x'; len]);

        let mut next = 0u32;
        let sent = send_window
            .fill(&mut outbound, segment, |_| -> Result<u32, Infallible> {
                next += 1;
                Ok(next)
            })
            .unwrap();

        let expected = window.min((len + segment - 1) / segment);
        prop_assert_eq!(sent, expected);
        prop_assert_eq!(send_window.in_flight(), expected);
        let filled: Vec<u32> = send_window.slots().iter().flatten().copied().collect();
        prop_assert_eq!(filled, (1..=expected as u32).collect::<Vec<_>>());
    }

    #[test]
    fn prop_receive_buffer_preserves_order(
        payloads in prop::collection::vec(small_payload_strategy(), 0..16),
        reads in prop::collection::vec(1usize..64, 1..32),
    ) {
        let mut buffer = ReceiveBuffer::new();
        let mut expected = Vec::new();
        for (seq, payload) in payloads.iter().enumerate() {
            buffer.push(seq as u32, payload);
            expected.extend_from_slice(payload);
        }

        let mut delivered = Vec::new();
        for n in reads.iter().cycle() {
            if buffer.is_empty() {
                break;
            }
            let chunk = buffer.take(*n);
            prop_assert!(chunk.len() <= *n);
            delivered.extend_from_slice(&chunk);
        }
        prop_assert_eq!(delivered, expected);
    }
}
