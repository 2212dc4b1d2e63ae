//! End-to-end integration tests
//!
//! Runs listeners and connections against each other over loopback UDP with
//! short retry and close timers.

use bytes::Bytes;
use rxp::{Connection, ConnectionError, ConnectionState, Listener, RxpConfig};
use rxp_io::RxpSocket;
use rxp_protocol::{Flags, Packet};
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

fn fast_config() -> RxpConfig {
    RxpConfig {
        retry_delay: Duration::from_millis(100),
        close_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        connect_timeout: Some(Duration::from_secs(5)),
        ..RxpConfig::default()
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Accept on a fresh listener while a client connects to it
fn connected_pair(client_window: usize, server_window: usize) -> (Connection, Connection) {
    let config = RxpConfig {
        window_size: server_window,
        ..fast_config()
    };
    let listener = Listener::listen(loopback(), config).unwrap();
    let server_addr = listener.local_addr();

    let client = thread::spawn(move || {
        Listener::connect(loopback(), server_addr, client_window, fast_config())
    });
    let server = listener.accept_timeout(Duration::from_secs(5)).unwrap();
    let client = client.join().unwrap().unwrap();

    // the listener keeps forwarding stragglers for the server connection
    thread::spawn(move || {
        let _ = listener.accept_timeout(Duration::from_secs(10));
    });
    (client, server)
}

fn receive_exactly(connection: &Connection, len: usize) -> Vec<u8> {
    let mut received = Vec::new();
    while received.len() < len {
        let chunk = connection
            .receive_timeout(512, Duration::from_secs(5))
            .unwrap();
        if chunk.is_empty() {
            break;
        }
        received.extend_from_slice(&chunk);
    }
    received
}

fn wait_for_state(connection: &Connection, state: ConnectionState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if connection.state() == state {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    connection.state() == state
}

#[test]
fn test_handshake_establishes_both_sides() {
    let (client, server) = connected_pair(1, 1);

    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(client.remote_addr(), server.local_addr());
    assert_eq!(server.remote_addr(), client.local_addr());
}

#[test]
fn test_client_to_server_transfer() {
    let (client, server) = connected_pair(1, 1);

    client.send("hello my friend! guy", None).unwrap();
    let received = receive_exactly(&server, 20);
    assert_eq!(received, b"hello my friend! guy");
}

#[test]
fn test_bidirectional_transfer() {
    let (client, server) = connected_pair(4, 2);

    client.send("get ", Some(b"notes.txt")).unwrap();
    assert_eq!(receive_exactly(&server, 13), b"get notes.txt");

    server.send("file ", Some(b"contents")).unwrap();
    assert_eq!(receive_exactly(&client, 13), b"file contents");
}

#[test]
fn test_large_transfer_with_window() {
    let (client, server) = connected_pair(8, 1);
    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

    client.send("", Some(&payload)).unwrap();
    assert_eq!(receive_exactly(&server, payload.len()), payload);

    // every segment acknowledged, window drained
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.send_window().iter().any(Option::is_some) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(client.send_window().iter().all(Option::is_none));
}

#[test]
fn test_appending_sends() {
    let (client, server) = connected_pair(1, 1);

    client.send("first ", None).unwrap();
    client.send("second", None).unwrap();
    assert_eq!(receive_exactly(&server, 12), b"first second");
}

#[test]
fn test_close_reaches_closed_on_both_sides() {
    let (client, server) = connected_pair(1, 1);

    client.close().unwrap();
    assert!(wait_for_state(&client, ConnectionState::Closed));
    assert!(wait_for_state(&server, ConnectionState::Closed));

    assert!(server.receive(10).is_empty());
    assert!(matches!(
        client.send("late", None),
        Err(ConnectionError::NotEstablished(ConnectionState::Closed))
    ));
}

#[test]
fn test_passive_side_drains_before_close() {
    let (client, server) = connected_pair(1, 1);

    client.send("bye", None).unwrap();
    assert_eq!(receive_exactly(&server, 3), b"bye");
    server.close().unwrap();

    assert!(wait_for_state(&client, ConnectionState::Closed));
    assert!(wait_for_state(&server, ConnectionState::Closed));
}

#[test]
fn test_lost_data_is_retransmitted() {
    let listener = Listener::listen(loopback(), fast_config()).unwrap();
    let server_addr = listener.local_addr();
    let peer = RxpSocket::bind(loopback()).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let me = peer.local_addr();

    let recv = |socket: &RxpSocket| {
        let mut buf = [0u8; 512];
        let (n, _) = socket.recv_from(&mut buf).unwrap().expect("datagram");
        Packet::from_bytes(&buf[..n]).unwrap()
    };

    // handshake by hand
    peer.send_to(&Packet::syn(me, server_addr, 1).to_bytes(), server_addr)
        .unwrap();
    let accepting = thread::spawn(move || {
        let connection = listener.accept_timeout(Duration::from_secs(5)).unwrap();
        (listener, connection)
    });
    let syn_ack = recv(&peer);
    assert_eq!(syn_ack.flags, Flags::SYN | Flags::ACK);
    peer.send_to(
        &Packet::ack(me, server_addr, syn_ack.sequence.unwrap()).to_bytes(),
        server_addr,
    )
    .unwrap();
    let (_listener, server) = accepting.join().unwrap();

    let next_data = |socket: &RxpSocket| loop {
        let packet = recv(socket);
        if packet.flags.contains(Flags::DATA) {
            break packet;
        }
    };

    server.send("lost", None).unwrap();
    let original = next_data(&peer);
    // drop it: no ACK, wait for the retransmission
    let resent = next_data(&peer);
    assert_eq!(resent.sequence, original.sequence);
    assert_eq!(resent.payload, Some(Bytes::from_static(b"lost")));

    let seq = resent.sequence.unwrap();
    peer.send_to(&Packet::ack(me, server_addr, seq).to_bytes(), server_addr)
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.send_window().contains(&Some(seq)) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!server.send_window().contains(&Some(seq)));
}

#[test]
fn test_connections_share_one_listener() {
    let listener = Listener::listen(loopback(), fast_config()).unwrap();
    let server_addr = listener.local_addr();

    let clients: Vec<_> = (0..3)
        .map(|_| {
            thread::spawn(move || {
                Listener::connect(loopback(), server_addr, 2, fast_config()).unwrap()
            })
        })
        .collect();

    let mut servers = Vec::new();
    for _ in 0..3 {
        servers.push(listener.accept_timeout(Duration::from_secs(5)).unwrap());
    }
    let clients: Vec<Connection> = clients.into_iter().map(|c| c.join().unwrap()).collect();
    assert_eq!(listener.established_count(), 3);

    let forwarding = thread::spawn(move || {
        let _ = listener.accept_timeout(Duration::from_secs(2));
    });

    for (i, client) in clients.iter().enumerate() {
        client.send(&format!("client {}", i), None).unwrap();
    }
    for server in &servers {
        let client = clients
            .iter()
            .position(|c| c.local_addr() == server.remote_addr())
            .unwrap();
        let expected = format!("client {}", client);
        assert_eq!(receive_exactly(server, expected.len()), expected.as_bytes());
    }
    forwarding.join().unwrap();
}
