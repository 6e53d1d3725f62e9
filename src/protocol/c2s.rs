//! Messages a client sends over its session, and the one table that decodes
//! them.
//!
//! Each type has a stable wire id and the protocol version that introduced
//! it. Decoding checks the version gate before touching any field, so a
//! too-old session is rejected with the offending type named rather than
//! with a garbled field error.

use crate::protocol::codec::{DecodeError, FieldReader, FieldWriter};
use crate::protocol::connection_id::ConnectionId;
use crate::protocol::join_type::JoinType;
use crate::protocol::punch_cookie::PunchCookie;
use bytes::BytesMut;
use uuid::Uuid;

/// A decoded client→server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Ask which of these friends are connected right now.
    ListOnline { friends: Vec<Uuid> },
    /// Send (or store for later) a friend request to this account.
    FriendRequest { to_user: Uuid },
    /// The sender's world is now open to these friends.
    PublishedWorld { friends: Vec<Uuid> },
    /// The sender's world is closed again for these friends.
    ClosedWorld { friends: Vec<Uuid> },
    /// Legacy join request addressed by account rather than connection.
    RequestJoin { friend: Uuid },
    /// The sender (a world owner) lets the named connection in.
    JoinGranted {
        connection_id: ConnectionId,
        join_type: JoinType,
    },
    /// Ask these friends' sessions for their world status payloads.
    QueryRequest { friends: Vec<Uuid> },
    /// Deprecated length-prefixed form of [`ClientMessage::NewQueryResponse`].
    QueryResponse {
        connection_id: ConnectionId,
        data: Vec<u8>,
    },
    /// Relay payload for a proxied external client.
    ProxyS2CPacket { circuit_id: i64, data: Vec<u8> },
    /// Close one proxied external client.
    ProxyDisconnect { circuit_id: i64 },
    /// Join request addressed by connection id.
    RequestDirectJoin { connection_id: ConnectionId },
    /// World status payload answering a query.
    NewQueryResponse {
        connection_id: ConnectionId,
        data: Vec<u8>,
    },
    /// Ask the server to broker a hole punch towards `target`.
    RequestPunchOpen {
        target: ConnectionId,
        purpose: String,
        cookie: PunchCookie,
        my_host: String,
        my_port: u16,
        my_local_host: String,
        my_local_port: u16,
    },
    /// The sender cannot complete this punch attempt.
    PunchFailed {
        target: ConnectionId,
        cookie: PunchCookie,
    },
    /// Start an external-port discovery exchange.
    BeginPortLookup { lookup_id: Uuid },
    /// The punch target reports where the source can reach it.
    PunchSuccess {
        cookie: PunchCookie,
        host: String,
        port: u16,
    },
}

/// Wire id and first protocol version for every client message type.
const SPECS: [(&str, u32); 16] = [
    ("ListOnline", 2),
    ("FriendRequest", 2),
    ("PublishedWorld", 2),
    ("ClosedWorld", 2),
    ("RequestJoin", 2),
    ("JoinGranted", 2),
    ("QueryRequest", 2),
    ("QueryResponse", 2),
    ("ProxyS2CPacket", 2),
    ("ProxyDisconnect", 2),
    ("RequestDirectJoin", 4),
    ("NewQueryResponse", 5),
    ("RequestPunchOpen", 7),
    ("PunchFailed", 7),
    ("BeginPortLookup", 7),
    ("PunchSuccess", 7),
];

impl ClientMessage {
    /// Name and first protocol version for a wire id, if the id is known.
    pub fn spec(type_id: u8) -> Option<(&'static str, u32)> {
        SPECS.get(usize::from(type_id)).copied()
    }

    pub fn type_id(&self) -> u8 {
        match self {
            Self::ListOnline { .. } => 0,
            Self::FriendRequest { .. } => 1,
            Self::PublishedWorld { .. } => 2,
            Self::ClosedWorld { .. } => 3,
            Self::RequestJoin { .. } => 4,
            Self::JoinGranted { .. } => 5,
            Self::QueryRequest { .. } => 6,
            Self::QueryResponse { .. } => 7,
            Self::ProxyS2CPacket { .. } => 8,
            Self::ProxyDisconnect { .. } => 9,
            Self::RequestDirectJoin { .. } => 10,
            Self::NewQueryResponse { .. } => 11,
            Self::RequestPunchOpen { .. } => 12,
            Self::PunchFailed { .. } => 13,
            Self::BeginPortLookup { .. } => 14,
            Self::PunchSuccess { .. } => 15,
        }
    }

    /// Decodes one frame payload, enforcing the type's version gate against
    /// the session's negotiated protocol version.
    pub fn decode(type_id: u8, payload: &[u8], negotiated: u32) -> Result<Self, DecodeError> {
        let (name, required) =
            Self::spec(type_id).ok_or(DecodeError::UnknownMessage(type_id))?;
        if negotiated < required {
            return Err(DecodeError::VersionTooOld {
                name,
                id: type_id,
                required,
                negotiated,
            });
        }
        let r = &mut FieldReader::new(payload);
        let message = match type_id {
            0 => Self::ListOnline {
                friends: r.read_uuid_list("friends")?,
            },
            1 => Self::FriendRequest {
                to_user: r.read_uuid("to user")?,
            },
            2 => Self::PublishedWorld {
                friends: r.read_uuid_list("friends")?,
            },
            3 => Self::ClosedWorld {
                friends: r.read_uuid_list("friends")?,
            },
            4 => Self::RequestJoin {
                friend: r.read_uuid("friend")?,
            },
            5 => Self::JoinGranted {
                connection_id: r.read_connection_id("connection id")?,
                join_type: JoinType::decode(r)?,
            },
            6 => Self::QueryRequest {
                friends: r.read_uuid_list("friends")?,
            },
            7 => Self::QueryResponse {
                connection_id: r.read_connection_id("connection id")?,
                data: r.read_prefixed_bytes("query data")?,
            },
            8 => Self::ProxyS2CPacket {
                circuit_id: r.read_i64("circuit id")?,
                data: r.read_rest(),
            },
            9 => Self::ProxyDisconnect {
                circuit_id: r.read_i64("circuit id")?,
            },
            10 => Self::RequestDirectJoin {
                connection_id: r.read_connection_id("connection id")?,
            },
            11 => Self::NewQueryResponse {
                connection_id: r.read_connection_id("connection id")?,
                data: r.read_prefixed_bytes("query data")?,
            },
            12 => Self::RequestPunchOpen {
                target: r.read_connection_id("target connection")?,
                purpose: r.read_string("purpose")?,
                cookie: r.read_cookie("cookie")?,
                my_host: r.read_string("host")?,
                my_port: r.read_u16("port")?,
                my_local_host: r.read_string("local host")?,
                my_local_port: r.read_u16("local port")?,
            },
            13 => Self::PunchFailed {
                target: r.read_connection_id("target connection")?,
                cookie: r.read_cookie("cookie")?,
            },
            14 => Self::BeginPortLookup {
                lookup_id: r.read_uuid("lookup id")?,
            },
            15 => Self::PunchSuccess {
                cookie: r.read_cookie("cookie")?,
                host: r.read_string("host")?,
                port: r.read_u16("port")?,
            },
            // spec() above returned Some, so the id is within the table.
            _ => return Err(DecodeError::UnknownMessage(type_id)),
        };
        Ok(message)
    }

    /// Encodes just the payload (no frame header). Used by client
    /// implementations and tests; the server itself only decodes this
    /// direction.
    pub fn encode_body(&self, buf: &mut BytesMut) {
        let w = &mut FieldWriter::new(buf);
        match self {
            Self::ListOnline { friends }
            | Self::PublishedWorld { friends }
            | Self::ClosedWorld { friends }
            | Self::QueryRequest { friends } => w.put_uuid_list(friends),
            Self::FriendRequest { to_user } => w.put_uuid(*to_user),
            Self::RequestJoin { friend } => w.put_uuid(*friend),
            Self::JoinGranted {
                connection_id,
                join_type,
            } => {
                w.put_connection_id(*connection_id);
                join_type.encode(w);
            }
            Self::QueryResponse {
                connection_id,
                data,
            }
            | Self::NewQueryResponse {
                connection_id,
                data,
            } => {
                w.put_connection_id(*connection_id);
                w.put_prefixed_bytes(data);
            }
            Self::ProxyS2CPacket { circuit_id, data } => {
                w.put_i64(*circuit_id);
                w.put_rest(data);
            }
            Self::ProxyDisconnect { circuit_id } => w.put_i64(*circuit_id),
            Self::RequestDirectJoin { connection_id } => w.put_connection_id(*connection_id),
            Self::RequestPunchOpen {
                target,
                purpose,
                cookie,
                my_host,
                my_port,
                my_local_host,
                my_local_port,
            } => {
                w.put_connection_id(*target);
                w.put_string(purpose);
                w.put_cookie(cookie);
                w.put_string(my_host);
                w.put_u16(*my_port);
                w.put_string(my_local_host);
                w.put_u16(*my_local_port);
            }
            Self::PunchFailed { target, cookie } => {
                w.put_connection_id(*target);
                w.put_cookie(cookie);
            }
            Self::BeginPortLookup { lookup_id } => w.put_uuid(*lookup_id),
            Self::PunchSuccess { cookie, host, port } => {
                w.put_cookie(cookie);
                w.put_string(host);
                w.put_u16(*port);
            }
        }
    }
}
