//! Messages the server sends to clients, with per-recipient version gating.
//!
//! Outbound gating is checked once, centrally, in
//! [`ServerMessage::for_recipient`]: a message newer than the recipient's
//! negotiated protocol version is silently withheld, except where a
//! deprecated equivalent exists and the message downgrades to it. Clients
//! tolerate trailing bytes, so fields appended in later protocol versions
//! are encoded unconditionally.

use crate::protocol::codec::{self, DecodeError, FieldReader, FieldWriter};
use crate::protocol::connection_id::ConnectionId;
use crate::protocol::punch_cookie::PunchCookie;
use crate::protocol::security_level::SecurityLevel;
use bytes::BytesMut;
use std::net::IpAddr;
use uuid::Uuid;

/// A server→client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Something went wrong; `critical` means the session is about to close.
    Error { message: String, critical: bool },
    /// A friend asked who is online; the sender of that request is online.
    IsOnlineTo { user: Uuid },
    /// A concrete way to reach a world the recipient may join.
    OnlineGame {
        host: String,
        port: u16,
        owner_connection_id: ConnectionId,
        punch_protocol: bool,
    },
    /// Incoming friend request with the sender's trust tier.
    FriendRequest {
        from_user: Uuid,
        security: SecurityLevel,
    },
    /// A friend's world opened to the recipient.
    PublishedWorld {
        user: Uuid,
        connection_id: ConnectionId,
    },
    /// A friend's world closed.
    ClosedWorld { user: Uuid },
    /// Someone asks to join the recipient's world.
    RequestJoin {
        user: Uuid,
        connection_id: ConnectionId,
    },
    /// A friend asks for the recipient's world status.
    QueryRequest {
        friend: Uuid,
        connection_id: ConnectionId,
    },
    /// Deprecated length-prefixed form of [`ServerMessage::NewQueryResponse`].
    QueryResponse { friend: Uuid, data: Vec<u8> },
    /// Relay payload from a proxied external client.
    ProxyC2SPacket { circuit_id: i64, data: Vec<u8> },
    /// A new external client was attached to the recipient's world.
    ProxyConnect { circuit_id: i64, remote_addr: IpAddr },
    /// A proxied external client went away.
    ProxyDisconnect { circuit_id: i64 },
    /// Post-handshake session parameters.
    ConnectionInfo {
        connection_id: ConnectionId,
        base_ip: String,
        base_port: u16,
        user_ip: String,
        protocol_version: i32,
        punch_port: u16,
    },
    /// The relay instance closest to the recipient.
    ExternalProxyServer {
        host: String,
        port: u16,
        base_addr: String,
        mc_port: u16,
    },
    /// The client is older than the current protocol; names the version to
    /// upgrade to.
    OutdatedWorldHost { recommended_version: String },
    /// A connection-addressed request named an id with no live session.
    ConnectionNotFound { connection_id: ConnectionId },
    /// World status payload answering a query.
    NewQueryResponse { friend: Uuid, data: Vec<u8> },
    /// A soft advisory the client should surface but may ignore.
    Warning { message: String, important: bool },
    /// A peer wants to hole-punch to the recipient.
    PunchOpenRequest {
        cookie: PunchCookie,
        purpose: String,
        from_host: String,
        from_port: u16,
        connection_id: ConnectionId,
        user: Uuid,
        security: SecurityLevel,
    },
    /// A pending port lookup expired.
    CancelPortLookup { lookup_id: Uuid },
    /// The server observed the client's external address for a port lookup.
    PortLookupSuccess {
        lookup_id: Uuid,
        host: String,
        port: u16,
    },
    /// A pending punch attempt was cancelled or expired.
    PunchRequestCancelled { cookie: PunchCookie },
    /// The punch target (or the server's UDP listener) reports where the
    /// requester can now reach it.
    PunchSuccess {
        cookie: PunchCookie,
        host: String,
        port: u16,
    },
}

/// Protocol version that introduced [`ServerMessage::NewQueryResponse`];
/// older recipients get the deprecated [`ServerMessage::QueryResponse`].
pub const NEW_QUERY_RESPONSE_VERSION: u32 = 5;

impl ServerMessage {
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Error { .. } => 0,
            Self::IsOnlineTo { .. } => 1,
            Self::OnlineGame { .. } => 2,
            Self::FriendRequest { .. } => 3,
            Self::PublishedWorld { .. } => 4,
            Self::ClosedWorld { .. } => 5,
            Self::RequestJoin { .. } => 6,
            Self::QueryRequest { .. } => 7,
            Self::QueryResponse { .. } => 8,
            Self::ProxyC2SPacket { .. } => 9,
            Self::ProxyConnect { .. } => 10,
            Self::ProxyDisconnect { .. } => 11,
            Self::ConnectionInfo { .. } => 12,
            Self::ExternalProxyServer { .. } => 13,
            Self::OutdatedWorldHost { .. } => 14,
            Self::ConnectionNotFound { .. } => 15,
            Self::NewQueryResponse { .. } => 16,
            Self::Warning { .. } => 17,
            Self::PunchOpenRequest { .. } => 18,
            Self::CancelPortLookup { .. } => 19,
            Self::PortLookupSuccess { .. } => 20,
            Self::PunchRequestCancelled { .. } => 21,
            Self::PunchSuccess { .. } => 22,
        }
    }

    /// Protocol version that introduced this message type.
    pub fn first_protocol_version(&self) -> u32 {
        match self {
            Self::ExternalProxyServer { .. } => 3,
            Self::ConnectionNotFound { .. } => 4,
            Self::NewQueryResponse { .. } => NEW_QUERY_RESPONSE_VERSION,
            Self::Warning { .. } => 6,
            Self::PunchOpenRequest { .. }
            | Self::CancelPortLookup { .. }
            | Self::PortLookupSuccess { .. }
            | Self::PunchRequestCancelled { .. }
            | Self::PunchSuccess { .. } => 7,
            _ => 2,
        }
    }

    /// Applies outbound version gating for one recipient.
    ///
    /// Returns the message to actually send, the deprecated downgrade where
    /// one exists, or `None` when the recipient is too old to understand it.
    pub fn for_recipient(self, negotiated: u32) -> Option<Self> {
        if negotiated >= self.first_protocol_version() {
            return Some(self);
        }
        match self {
            Self::NewQueryResponse { friend, data } => Some(Self::QueryResponse { friend, data }),
            _ => None,
        }
    }

    pub fn encode_body(&self, buf: &mut BytesMut) {
        let w = &mut FieldWriter::new(buf);
        match self {
            Self::Error { message, critical } => {
                w.put_string(message);
                w.put_bool(*critical);
            }
            Self::IsOnlineTo { user } => w.put_uuid(*user),
            Self::OnlineGame {
                host,
                port,
                owner_connection_id,
                punch_protocol,
            } => {
                w.put_string(host);
                w.put_u16(*port);
                w.put_connection_id(*owner_connection_id);
                w.put_bool(*punch_protocol);
            }
            Self::FriendRequest {
                from_user,
                security,
            } => {
                w.put_uuid(*from_user);
                w.put_u8(security.as_u8());
            }
            Self::PublishedWorld {
                user,
                connection_id,
            } => {
                w.put_uuid(*user);
                w.put_connection_id(*connection_id);
            }
            Self::ClosedWorld { user } => w.put_uuid(*user),
            Self::RequestJoin {
                user,
                connection_id,
            } => {
                w.put_uuid(*user);
                w.put_connection_id(*connection_id);
            }
            Self::QueryRequest {
                friend,
                connection_id,
            } => {
                w.put_uuid(*friend);
                w.put_connection_id(*connection_id);
            }
            Self::QueryResponse { friend, data } => {
                w.put_uuid(*friend);
                w.put_prefixed_bytes(data);
            }
            Self::ProxyC2SPacket { circuit_id, data } => {
                w.put_i64(*circuit_id);
                w.put_rest(data);
            }
            Self::ProxyConnect {
                circuit_id,
                remote_addr,
            } => {
                w.put_i64(*circuit_id);
                w.put_ip_addr(*remote_addr);
            }
            Self::ProxyDisconnect { circuit_id } => w.put_i64(*circuit_id),
            Self::ConnectionInfo {
                connection_id,
                base_ip,
                base_port,
                user_ip,
                protocol_version,
                punch_port,
            } => {
                w.put_connection_id(*connection_id);
                w.put_string(base_ip);
                w.put_u16(*base_port);
                w.put_string(user_ip);
                w.put_i32(*protocol_version);
                w.put_u16(*punch_port);
            }
            Self::ExternalProxyServer {
                host,
                port,
                base_addr,
                mc_port,
            } => {
                w.put_string(host);
                w.put_u16(*port);
                w.put_string(base_addr);
                w.put_u16(*mc_port);
            }
            Self::OutdatedWorldHost {
                recommended_version,
            } => w.put_string(recommended_version),
            Self::ConnectionNotFound { connection_id } => w.put_connection_id(*connection_id),
            Self::NewQueryResponse { friend, data } => {
                w.put_uuid(*friend);
                w.put_rest(data);
            }
            Self::Warning { message, important } => {
                w.put_string(message);
                w.put_bool(*important);
            }
            Self::PunchOpenRequest {
                cookie,
                purpose,
                from_host,
                from_port,
                connection_id,
                user,
                security,
            } => {
                w.put_cookie(cookie);
                w.put_string(purpose);
                w.put_string(from_host);
                w.put_u16(*from_port);
                w.put_connection_id(*connection_id);
                w.put_uuid(*user);
                w.put_u8(security.as_u8());
            }
            Self::CancelPortLookup { lookup_id } => w.put_uuid(*lookup_id),
            Self::PortLookupSuccess {
                lookup_id,
                host,
                port,
            } => {
                w.put_uuid(*lookup_id);
                w.put_string(host);
                w.put_u16(*port);
            }
            Self::PunchRequestCancelled { cookie } => w.put_cookie(cookie),
            Self::PunchSuccess { cookie, host, port } => {
                w.put_cookie(cookie);
                w.put_string(host);
                w.put_u16(*port);
            }
        }
    }

    /// Encodes the complete frame: length prefix, type id, payload.
    pub fn encode_frame(&self) -> BytesMut {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);
        codec::encode_frame(self.type_id(), &body)
    }

    /// Decodes one frame payload. The server never receives these; this is
    /// the client half of the protocol, used by client implementations and
    /// by this crate's own tests.
    pub fn decode(type_id: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let r = &mut FieldReader::new(payload);
        let message = match type_id {
            0 => Self::Error {
                message: r.read_string("message")?,
                critical: r.read_bool("critical")?,
            },
            1 => Self::IsOnlineTo {
                user: r.read_uuid("user")?,
            },
            2 => Self::OnlineGame {
                host: r.read_string("host")?,
                port: r.read_u16("port")?,
                owner_connection_id: r.read_connection_id("owner connection id")?,
                punch_protocol: r.read_bool("punch protocol")?,
            },
            3 => Self::FriendRequest {
                from_user: r.read_uuid("from user")?,
                security: SecurityLevel::from_u8(r.read_u8("security")?)?,
            },
            4 => Self::PublishedWorld {
                user: r.read_uuid("user")?,
                connection_id: r.read_connection_id("connection id")?,
            },
            5 => Self::ClosedWorld {
                user: r.read_uuid("user")?,
            },
            6 => Self::RequestJoin {
                user: r.read_uuid("user")?,
                connection_id: r.read_connection_id("connection id")?,
            },
            7 => Self::QueryRequest {
                friend: r.read_uuid("friend")?,
                connection_id: r.read_connection_id("connection id")?,
            },
            8 => Self::QueryResponse {
                friend: r.read_uuid("friend")?,
                data: r.read_prefixed_bytes("query data")?,
            },
            9 => Self::ProxyC2SPacket {
                circuit_id: r.read_i64("circuit id")?,
                data: r.read_rest(),
            },
            10 => Self::ProxyConnect {
                circuit_id: r.read_i64("circuit id")?,
                remote_addr: r.read_ip_addr("remote addr")?,
            },
            11 => Self::ProxyDisconnect {
                circuit_id: r.read_i64("circuit id")?,
            },
            12 => Self::ConnectionInfo {
                connection_id: r.read_connection_id("connection id")?,
                base_ip: r.read_string("base ip")?,
                base_port: r.read_u16("base port")?,
                user_ip: r.read_string("user ip")?,
                protocol_version: r.read_i32("protocol version")?,
                punch_port: r.read_u16("punch port")?,
            },
            13 => Self::ExternalProxyServer {
                host: r.read_string("host")?,
                port: r.read_u16("port")?,
                base_addr: r.read_string("base addr")?,
                mc_port: r.read_u16("mc port")?,
            },
            14 => Self::OutdatedWorldHost {
                recommended_version: r.read_string("recommended version")?,
            },
            15 => Self::ConnectionNotFound {
                connection_id: r.read_connection_id("connection id")?,
            },
            16 => Self::NewQueryResponse {
                friend: r.read_uuid("friend")?,
                data: r.read_rest(),
            },
            17 => Self::Warning {
                message: r.read_string("message")?,
                important: r.read_bool("important")?,
            },
            18 => Self::PunchOpenRequest {
                cookie: r.read_cookie("cookie")?,
                purpose: r.read_string("purpose")?,
                from_host: r.read_string("from host")?,
                from_port: r.read_u16("from port")?,
                connection_id: r.read_connection_id("connection id")?,
                user: r.read_uuid("user")?,
                security: SecurityLevel::from_u8(r.read_u8("security")?)?,
            },
            19 => Self::CancelPortLookup {
                lookup_id: r.read_uuid("lookup id")?,
            },
            20 => Self::PortLookupSuccess {
                lookup_id: r.read_uuid("lookup id")?,
                host: r.read_string("host")?,
                port: r.read_u16("port")?,
            },
            21 => Self::PunchRequestCancelled {
                cookie: r.read_cookie("cookie")?,
            },
            22 => Self::PunchSuccess {
                cookie: r.read_cookie("cookie")?,
                host: r.read_string("host")?,
                port: r.read_u16("port")?,
            },
            other => return Err(DecodeError::UnknownMessage(other)),
        };
        Ok(message)
    }
}
