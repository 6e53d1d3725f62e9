//! How a world owner lets a guest in: direct port, relay, or hole punch.

use crate::protocol::codec::{DecodeError, FieldReader, FieldWriter};
use std::fmt;

/// The connection strategy named inside a join grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// The owner opened `port` on their own router; guests connect straight
    /// to the owner's address.
    UPnP { port: u16 },
    /// Guests connect through the relay under the owner's mnemonic hostname.
    Proxy,
    /// Guests negotiate a UDP hole punch through the punch coordinator.
    Punch,
}

impl JoinType {
    pub fn decode(r: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        match r.read_u8("join type")? {
            0 => Ok(Self::UPnP {
                port: r.read_u16("upnp port")?,
            }),
            1 => Ok(Self::Proxy),
            2 => Ok(Self::Punch),
            other => Err(DecodeError::BadJoinType(other)),
        }
    }

    pub fn encode(&self, w: &mut FieldWriter<'_>) {
        match self {
            Self::UPnP { port } => {
                w.put_u8(0);
                w.put_u16(*port);
            }
            Self::Proxy => w.put_u8(1),
            Self::Punch => w.put_u8(2),
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UPnP { .. } => f.write_str("JoinType.UPnP"),
            Self::Proxy => f.write_str("JoinType.Proxy"),
            Self::Punch => f.write_str("JoinType.Punch"),
        }
    }
}
