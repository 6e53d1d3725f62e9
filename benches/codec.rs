use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use uuid::Uuid;
use world_beacon_server::protocol::{
    ClientMessage, ConnectionId, ServerMessage, CURRENT_PROTOCOL_VERSION,
};

fn bench_codec(c: &mut Criterion) {
    c.bench_function("server_message_encode_frame", |b| {
        let message = ServerMessage::ConnectionInfo {
            connection_id: ConnectionId::new(123_456_789).expect("id"),
            base_ip: "connect.worldhost.example".into(),
            base_port: 25565,
            user_ip: "203.0.113.9".into(),
            protocol_version: 7,
            punch_port: 9647,
        };
        b.iter(|| black_box(&message).encode_frame());
    });

    c.bench_function("client_message_decode", |b| {
        let message = ClientMessage::PublishedWorld {
            friends: (0..20).map(|_| Uuid::new_v4()).collect(),
        };
        let mut body = BytesMut::new();
        message.encode_body(&mut body);
        let type_id = message.type_id();

        b.iter(|| {
            ClientMessage::decode(type_id, black_box(&body), CURRENT_PROTOCOL_VERSION)
                .expect("decode")
        });
    });

    c.bench_function("connection_id_words_round_trip", |b| {
        let id = ConnectionId::new(0x2AB_CDEF_0123).expect("id");
        b.iter(|| {
            let words = black_box(id).to_words();
            words.parse::<ConnectionId>().expect("parse")
        });
    });
}

criterion_group!(codec, bench_codec);
criterion_main!(codec);
