//! 128-bit tokens correlating one NAT hole-punch attempt between two peers.

use std::fmt;
use thiserror::Error;

/// Size of a punch cookie on the wire.
pub const PUNCH_COOKIE_BYTES: usize = 16;

/// Opaque 128-bit token minted by the requesting client. The server only
/// matches it byte for byte; it carries no structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PunchCookie([u8; PUNCH_COOKIE_BYTES]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("punch cookie must be {PUNCH_COOKIE_BYTES} bytes, got {0}")]
pub struct BadCookieLength(pub usize);

impl PunchCookie {
    pub fn from_bytes(bytes: [u8; PUNCH_COOKIE_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUNCH_COOKIE_BYTES] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PunchCookie {
    type Error = BadCookieLength;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; PUNCH_COOKIE_BYTES] =
            value.try_into().map_err(|_| BadCookieLength(value.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PunchCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PunchCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PunchCookie({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_hex() {
        let mut bytes = [0u8; PUNCH_COOKIE_BYTES];
        bytes[0] = 0xab;
        bytes[15] = 0x01;
        let cookie = PunchCookie::from_bytes(bytes);
        assert_eq!(cookie.to_string(), "ab000000000000000000000000000001");
    }

    #[test]
    fn try_from_checks_length() {
        assert!(PunchCookie::try_from([0u8; 16].as_slice()).is_ok());
        assert_eq!(
            PunchCookie::try_from([0u8; 15].as_slice()),
            Err(BadCookieLength(15))
        );
    }
}
