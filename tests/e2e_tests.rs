//! Control-plane scenarios over real sockets: handshakes, presence,
//! publishing, joins, and admission control, exactly as a client sees them.


use test_helpers::{read_plain_frame, read_to_eof, start_server, WireClient};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use uuid::Uuid;
use world_beacon_server::protocol::{ClientMessage, ConnectionId, JoinType, ServerMessage};

fn cid(raw: u64) -> ConnectionId {
    ConnectionId::new(raw).expect("connection id")
}

#[tokio::test]
async fn handshake_delivers_connection_info() {
    let alice = Uuid::new_v4();
    let harness = start_server(&[("alice", alice)]).await;

    let mut client = WireClient::connect(harness.control, alice, "alice", 4242).await;
    assert_eq!(
        client.recv().await,
        ServerMessage::ConnectionInfo {
            connection_id: cid(4242),
            base_ip: "wb.test".into(),
            base_port: 25565,
            user_ip: "127.0.0.1".into(),
            protocol_version: 7,
            punch_port: 9647,
        }
    );
}

#[tokio::test]
async fn outdated_clients_are_nudged_to_upgrade() {
    let alice = Uuid::new_v4();
    let harness = start_server(&[("alice", alice)]).await;

    let mut client = WireClient::connect_with_version(harness.control, 6, alice, "alice", 1).await;
    assert!(matches!(
        client.recv().await,
        ServerMessage::ConnectionInfo {
            protocol_version: 7,
            ..
        }
    ));
    assert_eq!(
        client.recv().await,
        ServerMessage::OutdatedWorldHost {
            recommended_version: "0.4.15".into(),
        }
    );
}

#[tokio::test]
async fn unsupported_versions_are_turned_away() {
    let harness = start_server(&[]).await;

    let mut stream = TcpStream::connect(harness.control).await.expect("connect");
    stream.write_u32(1).await.expect("version");
    assert_eq!(
        read_plain_frame(&mut stream).await,
        ServerMessage::Error {
            message: "Unsupported protocol version 1".into(),
            critical: true,
        }
    );
    assert_eq!(read_to_eof(&mut stream).await, Vec::<u8>::new());
}

#[tokio::test]
async fn legacy_clients_connect_insecure_with_an_advisory() {
    let harness = start_server(&[]).await;

    let mut client =
        WireClient::connect_with_version(harness.control, 4, Uuid::new_v4(), "alice", 9).await;
    assert!(matches!(
        client.recv().await,
        ServerMessage::ConnectionInfo { .. }
    ));
    assert!(matches!(
        client.recv().await,
        ServerMessage::OutdatedWorldHost { .. }
    ));
    assert_eq!(
        client.recv().await,
        ServerMessage::Error {
            message: "You are using an old insecure version of World Host. It is highly \
                      recommended that you update to 0.4.14 or later."
                .into(),
            critical: false,
        }
    );
}

#[tokio::test]
async fn messages_from_the_future_end_the_session() {
    let harness = start_server(&[]).await;

    let mut client =
        WireClient::connect_with_version(harness.control, 4, Uuid::new_v4(), "alice", 9).await;
    client.recv().await;
    client.recv().await;
    client.recv().await;

    // NewQueryResponse did not exist until protocol 5.
    client
        .send(&ClientMessage::NewQueryResponse {
            connection_id: cid(9),
            data: b"status".to_vec(),
        })
        .await;
    assert_eq!(
        client.recv().await,
        ServerMessage::Error {
            message: "message `NewQueryResponse` (id 11) requires protocol version 5, \
                      but this session negotiated 4"
                .into(),
            critical: true,
        }
    );
    client.expect_eof().await;
}

#[tokio::test]
async fn published_worlds_flow_to_friends_and_grants_come_back() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let harness = start_server(&[("alice", alice), ("bob", bob)]).await;

    let mut host = WireClient::connect(harness.control, alice, "alice", 100).await;
    let mut joiner = WireClient::connect(harness.control, bob, "bob", 200).await;
    host.recv().await;
    joiner.recv().await;
    host.settle().await;
    joiner.settle().await;

    // Presence first: the joiner announces itself to its friends.
    joiner
        .send(&ClientMessage::ListOnline {
            friends: vec![alice],
        })
        .await;
    assert_eq!(host.recv().await, ServerMessage::IsOnlineTo { user: bob });

    host.send(&ClientMessage::PublishedWorld {
        friends: vec![bob],
    })
    .await;
    assert_eq!(
        joiner.recv().await,
        ServerMessage::PublishedWorld {
            user: alice,
            connection_id: cid(100),
        }
    );

    joiner
        .send(&ClientMessage::RequestDirectJoin {
            connection_id: cid(100),
        })
        .await;
    assert_eq!(
        host.recv().await,
        ServerMessage::RequestJoin {
            user: bob,
            connection_id: cid(200),
        }
    );

    host.send(&ClientMessage::JoinGranted {
        connection_id: cid(200),
        join_type: JoinType::UPnP { port: 31765 },
    })
    .await;
    assert_eq!(
        joiner.recv().await,
        ServerMessage::OnlineGame {
            host: "127.0.0.1".into(),
            port: 31765,
            owner_connection_id: cid(100),
            punch_protocol: false,
        }
    );

    host.send(&ClientMessage::ClosedWorld {
        friends: vec![bob],
    })
    .await;
    assert_eq!(joiner.recv().await, ServerMessage::ClosedWorld { user: alice });
}

#[tokio::test]
async fn a_dropped_host_closes_its_published_world() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let harness = start_server(&[("alice", alice), ("bob", bob)]).await;

    let mut host = WireClient::connect(harness.control, alice, "alice", 100).await;
    let mut joiner = WireClient::connect(harness.control, bob, "bob", 200).await;
    host.recv().await;
    joiner.recv().await;
    host.settle().await;
    joiner.settle().await;

    host.send(&ClientMessage::PublishedWorld {
        friends: vec![bob],
    })
    .await;
    assert_eq!(
        joiner.recv().await,
        ServerMessage::PublishedWorld {
            user: alice,
            connection_id: cid(100),
        }
    );

    // The host vanishes without closing; the server closes for it.
    drop(host);
    assert_eq!(joiner.recv().await, ServerMessage::ClosedWorld { user: alice });
}

#[tokio::test]
async fn friend_requests_wait_for_their_recipient() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let harness = start_server(&[("alice", alice), ("bob", bob)]).await;

    let mut sender = WireClient::connect(harness.control, alice, "alice", 1).await;
    sender.recv().await;
    sender
        .send(&ClientMessage::FriendRequest { to_user: bob })
        .await;
    // Settling after the send proves the request reached the store.
    sender.settle().await;

    // The recipient connects later and gets the stored request right after
    // its connection info.
    let mut recipient = WireClient::connect(harness.control, bob, "bob", 2).await;
    recipient.recv().await;
    match recipient.recv().await {
        ServerMessage::FriendRequest { from_user, .. } => assert_eq!(from_user, alice),
        other => panic!("unexpected message {other:?}"),
    }

    // Live delivery once both are connected.
    recipient
        .send(&ClientMessage::FriendRequest { to_user: alice })
        .await;
    match sender.recv().await {
        ServerMessage::FriendRequest { from_user, .. } => assert_eq!(from_user, bob),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn queries_round_trip_between_sessions() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let harness = start_server(&[("alice", alice), ("bob", bob)]).await;

    let mut host = WireClient::connect(harness.control, alice, "alice", 100).await;
    let mut asker = WireClient::connect(harness.control, bob, "bob", 200).await;
    host.recv().await;
    asker.recv().await;
    host.settle().await;
    asker.settle().await;

    asker
        .send(&ClientMessage::QueryRequest {
            friends: vec![alice],
        })
        .await;
    assert_eq!(
        host.recv().await,
        ServerMessage::QueryRequest {
            friend: bob,
            connection_id: cid(200),
        }
    );

    host.send(&ClientMessage::NewQueryResponse {
        connection_id: cid(200),
        data: vec![1, 2, 3],
    })
    .await;
    assert_eq!(
        asker.recv().await,
        ServerMessage::NewQueryResponse {
            friend: alice,
            data: vec![1, 2, 3],
        }
    );
}

#[tokio::test]
async fn rate_limited_addresses_are_refused() {
    let harness = start_server(&[]).await;

    // Burn the per-minute budget with cheap version probes. Reading each
    // rejection serializes the attempts, so the counts are deterministic.
    for _ in 0..20 {
        let mut stream = TcpStream::connect(harness.control).await.expect("connect");
        stream.write_u32(1).await.expect("version");
        assert_eq!(
            read_plain_frame(&mut stream).await,
            ServerMessage::Error {
                message: "Unsupported protocol version 1".into(),
                critical: true,
            }
        );
    }

    let mut stream = TcpStream::connect(harness.control).await.expect("connect");
    match read_plain_frame(&mut stream).await {
        ServerMessage::Error { message, critical } => {
            assert!(
                message
                    .starts_with("Ratelimit exceeded! too many connections (connections per minute)"),
                "{message}"
            );
            assert!(critical);
        }
        other => panic!("unexpected message {other:?}"),
    }
}
