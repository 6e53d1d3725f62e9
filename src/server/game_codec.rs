//! Just enough of the Minecraft protocol for the relay front door.
//!
//! The relay only ever parses the initial handshake packet (to learn which
//! world the player is dialing) and emits disconnect screens and status
//! pongs. Everything past the handshake is opaque bytes forwarded to the
//! hosting client.

use std::io;

use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const SEGMENT_BITS: u32 = 0x7f;
const CONTINUE_BIT: u32 = 0x80;

/// Hard cap on the initial handshake frame from an unproven client.
pub const MAX_HANDSHAKE_LEN: usize = 4096;

const MAX_ADDRESS_LEN: usize = 255;

/// `nextState` value for a status (server list) handshake.
pub const STATUS_STATE: i32 = 1;

/// `nextState` value for a login handshake.
pub const LOGIN_STATE: i32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameCodecError {
    #[error("varint is more than 32 bits")]
    VarIntTooBig,
    #[error("varint value {0} is not a valid length")]
    BadLength(i32),
    #[error("handshake frame of {0} bytes exceeds the {MAX_HANDSHAKE_LEN} byte limit")]
    HandshakeTooLarge(usize),
    #[error("string of {len} bytes exceeds the {max} byte limit")]
    StringTooLong { len: usize, max: usize },
    #[error("packet ended early while reading {0}")]
    Truncated(&'static str),
}

/// Read-side failures: socket errors or malformed packets.
#[derive(Debug, Error)]
pub enum GameFrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] GameCodecError),
}

/// The fields of the handshake packet the relay cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub next_state: i32,
}

impl Handshake {
    /// Parses one handshake packet body (the bytes after the length prefix).
    /// Trailing bytes are tolerated.
    pub fn parse(frame: &[u8]) -> Result<Self, GameCodecError> {
        let mut cursor = Cursor::new(frame);
        cursor.read_varint("packet id")?;
        let protocol_version = cursor.read_varint("protocol version")?;
        let server_address = cursor.read_string(MAX_ADDRESS_LEN, "server address")?;
        cursor.skip(2, "server port")?;
        let next_state = cursor.read_varint("next state")?;
        Ok(Self {
            protocol_version,
            server_address,
            next_state,
        })
    }
}

/// Reads one Minecraft varint.
pub async fn read_varint<R>(reader: &mut R) -> Result<i32, GameFrameError>
where
    R: AsyncRead + Unpin,
{
    let mut value: u32 = 0;
    let mut position = 0;
    loop {
        let byte = u32::from(reader.read_u8().await?);
        value |= (byte & SEGMENT_BITS) << position;
        if byte & CONTINUE_BIT == 0 {
            return Ok(value as i32);
        }
        position += 7;
        if position >= 32 {
            return Err(GameCodecError::VarIntTooBig.into());
        }
    }
}

/// Reads one varint-length-prefixed frame, bounded by [`MAX_HANDSHAKE_LEN`].
pub async fn read_handshake_frame<R>(reader: &mut R) -> Result<Vec<u8>, GameFrameError>
where
    R: AsyncRead + Unpin,
{
    let raw_len = read_varint(reader).await?;
    let len = usize::try_from(raw_len).map_err(|_| GameCodecError::BadLength(raw_len))?;
    if len == 0 {
        return Err(GameCodecError::BadLength(raw_len).into());
    }
    if len > MAX_HANDSHAKE_LEN {
        return Err(GameCodecError::HandshakeTooLarge(len).into());
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

/// Prefixes a packet body with its varint length.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    put_varint(&mut out, body.len() as i32);
    out.extend_from_slice(body);
    out
}

/// Every byte to write before closing the socket on a rejected client: a
/// red disconnect screen, plus a zeroed pong when the client was only
/// pinging the server list.
pub fn disconnect_frames(message: &str, next_state: i32) -> Vec<u8> {
    let chat = json!({ "text": message, "color": "red" });
    let mut body = Vec::new();
    put_varint(&mut body, 0x00);
    if next_state == STATUS_STATE {
        put_string(&mut body, &json!({ "description": chat }).to_string());
    } else if next_state == LOGIN_STATE {
        put_string(&mut body, &chat.to_string());
    }
    let mut out = frame(&body);
    if next_state == STATUS_STATE {
        let mut pong = Vec::new();
        put_varint(&mut pong, 0x01);
        pong.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&frame(&pong));
    }
    out
}

fn put_varint(out: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !SEGMENT_BITS == 0 {
            out.push(value as u8);
            return;
        }
        out.push(((value & SEGMENT_BITS) | CONTINUE_BIT) as u8);
        value >>= 7;
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_varint(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], GameCodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(GameCodecError::Truncated(what))?;
        let slice = self.buf.get(self.pos..end).ok_or(GameCodecError::Truncated(what))?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize, what: &'static str) -> Result<(), GameCodecError> {
        self.take(n, what).map(|_| ())
    }

    fn read_varint(&mut self, what: &'static str) -> Result<i32, GameCodecError> {
        let mut value: u32 = 0;
        let mut position = 0;
        loop {
            let byte = u32::from(self.take(1, what)?[0]);
            value |= (byte & SEGMENT_BITS) << position;
            if byte & CONTINUE_BIT == 0 {
                return Ok(value as i32);
            }
            position += 7;
            if position >= 32 {
                return Err(GameCodecError::VarIntTooBig);
            }
        }
    }

    fn read_string(&mut self, max: usize, what: &'static str) -> Result<String, GameCodecError> {
        let raw_len = self.read_varint(what)?;
        let len = usize::try_from(raw_len).map_err(|_| GameCodecError::BadLength(raw_len))?;
        if len > max {
            return Err(GameCodecError::StringTooLong { len, max });
        }
        let bytes = self.take(len, what)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn varint_bytes(value: i32) -> Vec<u8> {
        let mut out = Vec::new();
        put_varint(&mut out, value);
        out
    }

    fn handshake_body(protocol: i32, address: &str, port: u16, next_state: i32) -> Vec<u8> {
        let mut body = Vec::new();
        put_varint(&mut body, 0x00);
        put_varint(&mut body, protocol);
        put_string(&mut body, address);
        body.extend_from_slice(&port.to_be_bytes());
        put_varint(&mut body, next_state);
        body
    }

    #[test]
    fn varints_use_seven_bit_groups() {
        assert_eq!(varint_bytes(0), [0x00]);
        assert_eq!(varint_bytes(127), [0x7f]);
        assert_eq!(varint_bytes(128), [0x80, 0x01]);
        assert_eq!(varint_bytes(300), [0xac, 0x02]);
        assert_eq!(varint_bytes(-1), [0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[tokio::test]
    async fn varint_reader_round_trips() {
        for value in [0, 1, 127, 128, 300, 25565, i32::MAX, -1, i32::MIN] {
            let bytes = varint_bytes(value);
            let mut reader = &bytes[..];
            assert_eq!(read_varint(&mut reader).await.ok(), Some(value), "{value}");
        }
    }

    #[tokio::test]
    async fn varint_reader_rejects_six_byte_encodings() {
        let mut reader = &[0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01][..];
        assert!(matches!(
            read_varint(&mut reader).await,
            Err(GameFrameError::Codec(GameCodecError::VarIntTooBig))
        ));
    }

    #[tokio::test]
    async fn handshake_frames_are_length_bounded() {
        let body = handshake_body(763, "host.example.com", 25565, LOGIN_STATE);
        let mut reader = &frame(&body)[..];
        let got = read_handshake_frame(&mut reader).await.expect("frame");
        assert_eq!(got, body);

        let mut oversize = varint_bytes((MAX_HANDSHAKE_LEN + 1) as i32);
        oversize.resize(oversize.len() + MAX_HANDSHAKE_LEN + 1, 0);
        let mut reader = &oversize[..];
        assert!(matches!(
            read_handshake_frame(&mut reader).await,
            Err(GameFrameError::Codec(GameCodecError::HandshakeTooLarge(_)))
        ));

        let mut reader = &varint_bytes(0)[..];
        assert!(matches!(
            read_handshake_frame(&mut reader).await,
            Err(GameFrameError::Codec(GameCodecError::BadLength(0)))
        ));
    }

    #[test]
    fn handshake_parse_extracts_address_and_state() {
        let body = handshake_body(763, "fast-train-word.wh.example.com", 25565, LOGIN_STATE);
        let parsed = Handshake::parse(&body).expect("parse");
        assert_eq!(parsed.protocol_version, 763);
        assert_eq!(parsed.server_address, "fast-train-word.wh.example.com");
        assert_eq!(parsed.next_state, LOGIN_STATE);
    }

    #[test]
    fn handshake_parse_tolerates_trailing_bytes() {
        let mut body = handshake_body(5, "a.b", 1, STATUS_STATE);
        body.extend_from_slice(&[1, 2, 3]);
        assert!(Handshake::parse(&body).is_ok());
    }

    #[test]
    fn handshake_parse_rejects_oversize_addresses() {
        let body = handshake_body(5, &"x".repeat(300), 1, LOGIN_STATE);
        assert!(matches!(
            Handshake::parse(&body),
            Err(GameCodecError::StringTooLong { len: 300, max: 255 })
        ));
    }

    #[test]
    fn handshake_parse_names_the_truncated_field() {
        let body = handshake_body(5, "a.b", 1, LOGIN_STATE);
        assert_eq!(
            Handshake::parse(&body[..body.len() - 3]),
            Err(GameCodecError::Truncated("server port"))
        );
    }

    #[test]
    fn login_disconnects_carry_red_chat_json() {
        let out = disconnect_frames("Couldn't find that server", LOGIN_STATE);
        let mut cursor = Cursor::new(&out);
        let len = cursor.read_varint("len").expect("len") as usize;
        assert_eq!(len, out.len() - 1);
        assert_eq!(cursor.read_varint("id").expect("id"), 0x00);
        let chat = cursor.read_string(262_144, "chat").expect("chat");
        let value: Value = serde_json::from_str(&chat).expect("json");
        assert_eq!(value["text"], "Couldn't find that server");
        assert_eq!(value["color"], "red");
        assert_eq!(cursor.pos, out.len());
    }

    #[test]
    fn status_disconnects_append_a_zeroed_pong() {
        let out = disconnect_frames("nope", STATUS_STATE);
        let mut cursor = Cursor::new(&out);
        let first_len = cursor.read_varint("len").expect("len") as usize;
        assert_eq!(cursor.read_varint("id").expect("id"), 0x00);
        let status = cursor.read_string(32767, "status").expect("status");
        let value: Value = serde_json::from_str(&status).expect("json");
        assert_eq!(value["description"]["text"], "nope");
        assert_eq!(value["description"]["color"], "red");

        let pong = &out[first_len + 1..];
        assert_eq!(pong, [9, 0x01, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn unknown_states_disconnect_with_a_bare_packet() {
        let out = disconnect_frames("nope", 9);
        assert_eq!(out, [1, 0x00]);
    }
}
