//! Relay and punch scenarios over real sockets: a control session on one
//! port, a game client on another, and UDP datagrams on a third, all
//! meeting in the middle.


use std::net::{IpAddr, Ipv4Addr};

use test_helpers::{game_handshake, read_to_eof, start_server, WireClient, LOGIN_STATE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use uuid::Uuid;
use world_beacon_server::protocol::{
    ClientMessage, ConnectionId, PunchCookie, ServerMessage, SecurityLevel, PUNCH_COOKIE_BYTES,
};

fn cid(raw: u64) -> ConnectionId {
    ConnectionId::new(raw).expect("connection id")
}

#[tokio::test]
async fn relayed_game_traffic_flows_through_a_circuit() {
    let alice = Uuid::new_v4();
    let harness = start_server(&[("alice", alice)]).await;

    let mut host = WireClient::connect(harness.control, alice, "alice", 50).await;
    host.recv().await;
    host.settle().await;

    let mut game = TcpStream::connect(harness.relay).await.expect("connect");
    let address = format!("{}.wb.test", cid(50).to_words());
    let handshake = game_handshake(&address, LOGIN_STATE);
    game.write_all(&handshake).await.expect("handshake");

    // The owner hears about the new circuit, then gets the handshake
    // replayed so its embedded server sees the packet it expects.
    assert_eq!(
        host.recv().await,
        ServerMessage::ProxyConnect {
            circuit_id: 0,
            remote_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    );
    assert_eq!(
        host.recv().await,
        ServerMessage::ProxyC2SPacket {
            circuit_id: 0,
            data: handshake,
        }
    );

    game.write_all(b"login start").await.expect("write");
    assert_eq!(
        host.recv().await,
        ServerMessage::ProxyC2SPacket {
            circuit_id: 0,
            data: b"login start".to_vec(),
        }
    );

    host.send(&ClientMessage::ProxyS2CPacket {
        circuit_id: 0,
        data: b"welcome back".to_vec(),
    })
    .await;
    let mut reply = vec![0u8; 12];
    game.read_exact(&mut reply).await.expect("read reply");
    assert_eq!(&reply, b"welcome back");

    // The owner hangs up the circuit; the game client sees a clean EOF.
    host.send(&ClientMessage::ProxyDisconnect { circuit_id: 0 })
        .await;
    assert_eq!(read_to_eof(&mut game).await, Vec::<u8>::new());

    // And once the game socket is gone the owner is told the circuit died.
    drop(game);
    assert_eq!(
        host.recv().await,
        ServerMessage::ProxyDisconnect { circuit_id: 0 }
    );
}

#[tokio::test]
async fn the_relay_rejects_unknown_servers_with_a_login_screen() {
    let harness = start_server(&[]).await;

    let mut game = TcpStream::connect(harness.relay).await.expect("connect");
    let address = format!("{}.wb.test", cid(987_654).to_words());
    game.write_all(&game_handshake(&address, LOGIN_STATE))
        .await
        .expect("handshake");

    let raw = read_to_eof(&mut game).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("Couldn't find that server"), "{text}");
}

#[tokio::test]
async fn port_lookups_report_the_observed_udp_endpoint() {
    let alice = Uuid::new_v4();
    let harness = start_server(&[("alice", alice)]).await;

    let mut client = WireClient::connect(harness.control, alice, "alice", 77).await;
    client.recv().await;

    let lookup_id = Uuid::new_v4();
    client
        .send(&ClientMessage::BeginPortLookup { lookup_id })
        .await;
    // Settling after the send proves the lookup is pending before the
    // datagram can race it.
    client.settle().await;

    let probe = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    probe
        .send_to(lookup_id.as_bytes(), harness.punch)
        .await
        .expect("send datagram");

    assert_eq!(
        client.recv().await,
        ServerMessage::PortLookupSuccess {
            lookup_id,
            host: "127.0.0.1".into(),
            port: probe.local_addr().expect("addr").port(),
        }
    );
}

#[tokio::test]
async fn punch_brokering_reports_the_observed_address_to_the_requester() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let harness = start_server(&[("alice", alice), ("bob", bob)]).await;

    let mut owner = WireClient::connect(harness.control, alice, "alice", 10).await;
    let mut guest = WireClient::connect(harness.control, bob, "bob", 20).await;
    owner.recv().await;
    guest.recv().await;
    owner.settle().await;
    guest.settle().await;

    let cookie = PunchCookie::from_bytes([7; PUNCH_COOKIE_BYTES]);
    guest
        .send(&ClientMessage::RequestPunchOpen {
            target: cid(10),
            purpose: "join".into(),
            cookie,
            my_host: "198.51.100.7".into(),
            my_port: 40000,
            my_local_host: "10.0.0.2".into(),
            my_local_port: 25565,
        })
        .await;

    assert_eq!(
        owner.recv().await,
        ServerMessage::PunchOpenRequest {
            cookie,
            purpose: "join".into(),
            from_host: "198.51.100.7".into(),
            from_port: 40000,
            connection_id: cid(20),
            user: bob,
            security: SecurityLevel::Secure,
        }
    );

    // The owner opens its game port and pings the punch socket, standing in
    // for the UDP path the peers would open between themselves.
    let game_port = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    game_port
        .send_to(cookie.as_bytes(), harness.punch)
        .await
        .expect("send datagram");

    assert_eq!(
        guest.recv().await,
        ServerMessage::PunchSuccess {
            cookie,
            host: "127.0.0.1".into(),
            port: game_port.local_addr().expect("addr").port(),
        }
    );
}
