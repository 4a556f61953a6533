//! Retransmission behaviour observed from a hand-driven peer.
//!
//! The "server" here is a bare `tokio::net::UdpSocket`, so every datagram the
//! client emits can be inspected byte for byte and acks can be withheld.  The
//! last tests turn it around: a bare socket plays the client against a real
//! [`Listener`] and sends whatever a lossy or hostile peer might.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use prudp::packet::{Packet, PacketFlags, PacketType};
use prudp::timer::TimerConfig;
use prudp::{
    connect, AccessKey, ConnectionConfig, ConnectionHandle, ConnectionState, Listener,
    ListenerConfig,
};

const KEY: &str = "ridfebb9";
const SERVER_SIGNATURE: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn checksum_key() -> u8 {
    AccessKey::from(KEY).checksum_key()
}

fn client_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::new(KEY);
    config.timers = TimerConfig {
        retransmit_timeout: Duration::from_millis(50),
        ..TimerConfig::default()
    };
    config
}

async fn bind_listener(timers: TimerConfig) -> (Listener, SocketAddr) {
    let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap(), KEY);
    config.timers = timers;
    let listener = Listener::bind(config).await.expect("bind listener");
    let addr = listener.local_addr();
    (listener, addr)
}

async fn raw_peer() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("nothing received")
        .unwrap();
    buf.truncate(n);
    (buf, from)
}

async fn send(socket: &UdpSocket, mut packet: Packet, to: SocketAddr) {
    let bytes = packet.seal(checksum_key()).unwrap();
    socket.send_to(&bytes, to).await.unwrap();
}

fn ack_for(packet: &Packet) -> Packet {
    let mut ack = Packet::new(packet.packet_type, packet.destination, packet.source);
    ack.flags = PacketFlags::ACK | PacketFlags::HAS_SIZE;
    ack.sequence_id = packet.sequence_id;
    ack
}

/// Next datagram within `wait`, if any.
async fn recv_within(socket: &UdpSocket, wait: Duration) -> Option<Packet> {
    let mut buf = vec![0u8; 2048];
    match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((n, _))) => Some(Packet::parse(&buf[..n]).unwrap()),
        _ => None,
    }
}

/// Send `packet` until an ack of the same type comes back, at most three
/// times.
async fn exchange(socket: &UdpSocket, packet: &Packet, to: SocketAddr) -> Option<Packet> {
    for _ in 0..3 {
        send(socket, packet.clone(), to).await;
        while let Some(reply) = recv_within(socket, Duration::from_millis(200)).await {
            if reply.packet_type == packet.packet_type && reply.is_ack() {
                return Some(reply);
            }
        }
    }
    None
}

/// Run both client legs of the handshake by hand; returns the server's
/// signature.
async fn raw_handshake(peer: &UdpSocket, server: SocketAddr) -> [u8; 4] {
    let syn_ack = exchange(peer, &Packet::syn(0xAF, 0xA1), server)
        .await
        .expect("no SYN-ACK");
    let server_signature = syn_ack.connection_signature.expect("SYN-ACK without signature");

    let connect = Packet::connect(0xAF, 0xA1, [1, 2, 3, 4], server_signature);
    exchange(peer, &connect, server).await.expect("no CONNECT-ACK");
    server_signature
}

/// Receive datagrams until one is not of type `skip`.
async fn recv_skipping(socket: &UdpSocket, skip: PacketType) -> (Vec<u8>, Packet, SocketAddr) {
    loop {
        let (bytes, from) = recv(socket).await;
        let packet = Packet::parse(&bytes).unwrap();
        if packet.packet_type != skip {
            return (bytes, packet, from);
        }
    }
}

/// Drive the handshake by hand and return the opened client.
async fn open_client(peer: &UdpSocket, peer_addr: SocketAddr) -> (ConnectionHandle, SocketAddr) {
    let mut client = connect(peer_addr, client_config()).await.unwrap();

    let (_, from) = recv(peer).await;
    let mut syn_ack = Packet::syn(0xA1, 0xAF);
    syn_ack.flags = PacketFlags::ACK | PacketFlags::HAS_SIZE;
    syn_ack.connection_signature = Some(SERVER_SIGNATURE);
    send(peer, syn_ack, from).await;

    let (_, connect, _) = recv_skipping(peer, PacketType::Syn).await;
    let mut connect_ack = ack_for(&connect);
    connect_ack.packet_signature = connect.connection_signature.unwrap();
    send(peer, connect_ack, from).await;

    tokio::time::timeout(Duration::from_secs(2), client.wait_connected())
        .await
        .expect("handshake timed out")
        .unwrap();
    (client, from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unanswered_syn_is_resent_identically() {
    let (peer, peer_addr) = raw_peer().await;
    let _client = connect(peer_addr, client_config()).await.unwrap();

    let (first, _) = recv(&peer).await;
    let (second, _) = recv(&peer).await;
    let (third, _) = recv(&peer).await;

    assert_eq!(first, second);
    assert_eq!(second, third);

    let syn = Packet::parse(&first).unwrap();
    assert_eq!(syn.packet_type, PacketType::Syn);
    assert_eq!(syn.sequence_id, 0);
    assert!(syn.has_flag(PacketFlags::NEED_ACK));
    assert!(syn.verify_checksum(checksum_key()));
}

#[tokio::test]
async fn syn_ack_stops_syn_resends_and_triggers_connect() {
    let (peer, peer_addr) = raw_peer().await;
    let client = connect(peer_addr, client_config()).await.unwrap();

    let (_, from) = recv(&peer).await;
    let mut syn_ack = Packet::syn(0xA1, 0xAF);
    syn_ack.flags = PacketFlags::ACK | PacketFlags::HAS_SIZE;
    syn_ack.connection_signature = Some(SERVER_SIGNATURE);
    send(&peer, syn_ack, from).await;

    let (connect_bytes, connect, _) = recv_skipping(&peer, PacketType::Syn).await;
    assert_eq!(connect.packet_type, PacketType::Connect);
    assert_eq!(connect.sequence_id, 1);
    assert_eq!(connect.packet_signature, SERVER_SIGNATURE);

    // CONNECT is unacked, so it keeps coming; SYN does not.
    for _ in 0..3 {
        let (bytes, _) = recv(&peer).await;
        assert_eq!(bytes, connect_bytes);
    }
    assert_eq!(client.state(), ConnectionState::Connecting);
}

#[tokio::test]
async fn data_is_resent_until_acked() {
    let (peer, peer_addr) = raw_peer().await;
    let (client, from) = open_client(&peer, peer_addr).await;

    assert!(client.send(b"payload".to_vec()).await.unwrap());

    let (first, data, _) = recv_skipping(&peer, PacketType::Connect).await;
    assert_eq!(data.packet_type, PacketType::Data);
    assert_eq!(data.payload, b"payload");
    let (second, _) = recv(&peer).await;
    assert_eq!(first, second);

    send(&peer, ack_for(&data), from).await;

    // Drain anything already in flight, then expect silence.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut buf = [0u8; 2048];
    while let Ok(Ok(_)) =
        tokio::time::timeout(Duration::from_millis(1), peer.recv_from(&mut buf)).await
    {}
    let quiet = tokio::time::timeout(Duration::from_millis(200), peer.recv_from(&mut buf)).await;
    assert!(quiet.is_err(), "DATA resent after its ack");
}

#[tokio::test]
async fn full_window_drops_sends() {
    let (peer, peer_addr) = raw_peer().await;
    let (client, _) = open_client(&peer, peer_addr).await;

    for i in 0..5u8 {
        assert!(client.send(vec![i]).await.unwrap());
    }
    assert!(!client.send(b"sixth".to_vec()).await.unwrap());
}

#[tokio::test]
async fn resent_disconnect_is_acked_after_server_closed() {
    let (_listener, server_addr) = bind_listener(TimerConfig::default()).await;
    let (peer, _) = raw_peer().await;
    let server_signature = raw_handshake(&peer, server_addr).await;

    let mut disconnect = Packet::disconnect(0xAF, 0xA1);
    disconnect.sequence_id = 2;
    disconnect.packet_signature = server_signature;
    let first = exchange(&peer, &disconnect, server_addr).await;
    assert!(first.is_some(), "DISCONNECT never acked");

    // Our ack went missing as far as the server knows; the session is gone.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let again = exchange(&peer, &disconnect, server_addr)
        .await
        .expect("resent DISCONNECT not acked after close");
    assert_eq!(again.sequence_id, 2);
    assert_eq!(again.source, 0xA1);
    assert_eq!(again.destination, 0xAF);
    assert!(again.verify_checksum(checksum_key()));
}

#[tokio::test]
async fn syn_to_another_channel_is_admitted() {
    let (_listener, server_addr) = bind_listener(TimerConfig::default()).await;
    let (peer, _) = raw_peer().await;

    let syn_ack = exchange(&peer, &Packet::syn(0xAF, 0xA5), server_addr)
        .await
        .expect("SYN to channel 0xA5 ignored");
    assert!(syn_ack.has_flag(PacketFlags::HAS_SIZE));
    assert!(syn_ack.connection_signature.is_some());
}

#[tokio::test]
async fn abandoned_handshake_is_forgotten() {
    let (mut listener, server_addr) = bind_listener(TimerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..TimerConfig::default()
    })
    .await;
    let (peer, _) = raw_peer().await;

    let syn_ack = exchange(&peer, &Packet::syn(0xAF, 0xA1), server_addr)
        .await
        .expect("no SYN-ACK");
    let server_signature = syn_ack.connection_signature.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let connect = Packet::connect(0xAF, 0xA1, [1, 2, 3, 4], server_signature);
    send(&peer, connect, server_addr).await;
    assert!(
        recv_within(&peer, Duration::from_millis(300)).await.is_none(),
        "CONNECT accepted after the handshake deadline"
    );
    let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(accepted.is_err());
}

#[tokio::test]
async fn completed_handshake_outlives_the_handshake_deadline() {
    let (mut listener, server_addr) = bind_listener(TimerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..TimerConfig::default()
    })
    .await;
    let (peer, _) = raw_peer().await;
    raw_handshake(&peer, server_addr).await;
    let server = tokio::time::timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.state(), ConnectionState::Open);
}
