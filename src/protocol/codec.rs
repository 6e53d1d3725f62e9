//! Binary framing and field primitives for the session protocol.
//!
//! Every frame is `u32 length | u8 typeId | payload`, all integers
//! big-endian, where `length` counts the type byte plus the payload. Inside
//! a payload, fields follow the declared order of the message type using the
//! primitives defined here: fixed-width integers, `u16`-length-prefixed UTF-8
//! strings, 16-byte UUIDs and punch cookies, `u8`-length-prefixed raw IP
//! octets, and byte blobs that are either `u32`-length-prefixed or run to the
//! end of the frame. Only the last field of a message may be unbounded.

use crate::protocol::connection_id::{ConnectionId, ConnectionIdError};
use crate::protocol::punch_cookie::{PunchCookie, PUNCH_COOKIE_BYTES};
use crate::protocol::security_level::BadSecurityLevel;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use uuid::Uuid;

/// Hard cap on the decoded frame length (type byte + payload).
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Why a frame or field failed to decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame ended early while reading {0}")]
    UnexpectedEnd(&'static str),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("unknown message id {0}")]
    UnknownMessage(u8),
    #[error("message `{name}` (id {id}) requires protocol version {required}, but this session negotiated {negotiated}")]
    VersionTooOld {
        name: &'static str,
        id: u8,
        required: u32,
        negotiated: u32,
    },
    #[error("unknown join type {0}")]
    BadJoinType(u8),
    #[error("ip address field has invalid length {0}")]
    BadAddressLength(usize),
    #[error(transparent)]
    BadConnectionId(#[from] ConnectionIdError),
    #[error(transparent)]
    BadSecurityLevel(#[from] BadSecurityLevel),
}

/// Validates a frame length freshly read off the wire.
pub fn check_frame_len(len: usize) -> Result<(), DecodeError> {
    if len == 0 {
        return Err(DecodeError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge(len));
    }
    Ok(())
}

/// Assembles a complete frame (length prefix, type id, payload).
pub fn encode_frame(type_id: u8, body: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(4 + 1 + body.len());
    frame.put_u32(body.len() as u32 + 1);
    frame.put_u8(type_id);
    frame.put_slice(body);
    frame
}

/// Sequential field reader over one frame payload.
///
/// Trailing bytes a reader never consumes are deliberately tolerated: newer
/// peers append fields to the end of existing messages.
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::UnexpectedEnd(what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        let bytes = self.take(1, what)?;
        Ok(bytes[0])
    }

    pub fn read_u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes(fixed(bytes)))
    }

    pub fn read_u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_be_bytes(fixed(bytes)))
    }

    pub fn read_i32(&mut self, what: &'static str) -> Result<i32, DecodeError> {
        let bytes = self.take(4, what)?;
        Ok(i32::from_be_bytes(fixed(bytes)))
    }

    pub fn read_u64(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        let bytes = self.take(8, what)?;
        Ok(u64::from_be_bytes(fixed(bytes)))
    }

    pub fn read_i64(&mut self, what: &'static str) -> Result<i64, DecodeError> {
        let bytes = self.take(8, what)?;
        Ok(i64::from_be_bytes(fixed(bytes)))
    }

    pub fn read_bool(&mut self, what: &'static str) -> Result<bool, DecodeError> {
        Ok(self.read_u8(what)? != 0)
    }

    pub fn read_connection_id(&mut self, what: &'static str) -> Result<ConnectionId, DecodeError> {
        Ok(ConnectionId::new(self.read_u64(what)?)?)
    }

    pub fn read_uuid(&mut self, what: &'static str) -> Result<Uuid, DecodeError> {
        let bytes = self.take(16, what)?;
        Ok(Uuid::from_bytes(fixed(bytes)))
    }

    pub fn read_cookie(&mut self, what: &'static str) -> Result<PunchCookie, DecodeError> {
        let bytes = self.take(PUNCH_COOKIE_BYTES, what)?;
        Ok(PunchCookie::from_bytes(fixed(bytes)))
    }

    pub fn read_string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let len = usize::from(self.read_u16(what)?);
        let bytes = self.take(len, what)?;
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(text.to_string())
    }

    /// Reads a `u8`-length-prefixed raw IP address (4 or 16 octets).
    pub fn read_ip_addr(&mut self, what: &'static str) -> Result<IpAddr, DecodeError> {
        let len = usize::from(self.read_u8(what)?);
        let bytes = self.take(len, what)?;
        match len {
            4 => Ok(IpAddr::V4(Ipv4Addr::from(fixed::<4>(bytes)))),
            16 => Ok(IpAddr::V6(Ipv6Addr::from(fixed::<16>(bytes)))),
            other => Err(DecodeError::BadAddressLength(other)),
        }
    }

    /// Reads a `u32`-length-prefixed byte blob.
    pub fn read_prefixed_bytes(&mut self, what: &'static str) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32(what)? as usize;
        Ok(self.take(len, what)?.to_vec())
    }

    /// Consumes all remaining payload bytes.
    pub fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.buf.to_vec();
        self.buf = &[];
        rest
    }

    /// Reads `u32 count` then that many UUIDs.
    pub fn read_uuid_list(&mut self, what: &'static str) -> Result<Vec<Uuid>, DecodeError> {
        let count = self.read_u32(what)? as usize;
        // The count is claimed by the peer; cap the preallocation by what the
        // frame can actually still hold.
        let mut list = Vec::with_capacity(count.min(self.remaining() / 16));
        for _ in 0..count {
            list.push(self.read_uuid(what)?);
        }
        Ok(list)
    }
}

/// Sequential field writer appending to a frame payload. Infallible for
/// well-formed inputs; wire strings are capped at `u16::MAX` bytes.
pub struct FieldWriter<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> FieldWriter<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn put_connection_id(&mut self, id: ConnectionId) {
        self.buf.put_u64(id.as_u64());
    }

    pub fn put_uuid(&mut self, id: Uuid) {
        self.buf.put_slice(id.as_bytes());
    }

    pub fn put_cookie(&mut self, cookie: &PunchCookie) {
        self.buf.put_slice(cookie.as_bytes());
    }

    pub fn put_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        debug_assert!(bytes.len() <= usize::from(u16::MAX), "wire string too long");
        let len = bytes.len().min(usize::from(u16::MAX));
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&bytes[..len]);
    }

    pub fn put_ip_addr(&mut self, addr: IpAddr) {
        match addr {
            IpAddr::V4(v4) => {
                self.buf.put_u8(4);
                self.buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                self.buf.put_u8(16);
                self.buf.put_slice(&v6.octets());
            }
        }
    }

    pub fn put_prefixed_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    pub fn put_rest(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn put_uuid_list(&mut self, list: &[Uuid]) {
        self.buf.put_u32(list.len() as u32);
        for id in list {
            self.buf.put_slice(id.as_bytes());
        }
    }
}

/// Copies a checked-length slice into a fixed array. Callers always pass a
/// slice of exactly `N` bytes taken via [`FieldReader::take`].
fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(bytes);
    array
}
