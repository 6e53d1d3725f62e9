// Protocol module: framing, message types, identifiers, version table

pub mod c2s;
pub mod codec;
pub mod connection_id;
pub mod join_type;
pub mod punch_cookie;
pub mod s2c;
pub mod security_level;
pub mod words;

// Re-export the types the rest of the crate works with day to day.

pub use c2s::ClientMessage;
pub use codec::{DecodeError, FieldReader, FieldWriter, MAX_FRAME_LEN};
pub use connection_id::{ConnectionId, ConnectionIdError, MAX_CONNECTION_ID};
pub use join_type::JoinType;
pub use punch_cookie::{PunchCookie, PUNCH_COOKIE_BYTES};
pub use s2c::ServerMessage;
pub use security_level::SecurityLevel;

/// Oldest protocol version this server still speaks.
pub const EARLIEST_PROTOCOL_VERSION: u32 = 2;

/// Protocol version current clients negotiate.
pub const CURRENT_PROTOCOL_VERSION: u32 = 7;

/// First version that performs the RSA challenge handshake and carries a
/// username for identity verification.
pub const NEW_AUTH_PROTOCOL_VERSION: u32 = 6;

/// First version that wraps the whole stream in AES-CFB8 after the
/// handshake.
pub const ENCRYPTED_PROTOCOL_VERSION: u32 = 7;

/// Client release that introduced each protocol version. The current entry
/// is what `OutdatedWorldHost` recommends to old clients.
const VERSION_NAMES: [(u32, &str); 6] = [
    (2, "0.3.2"),
    (3, "0.3.4"),
    (4, "0.4.3"),
    (5, "0.4.4"),
    (6, "0.4.14"),
    (7, "0.4.15"),
];

/// Whether this server can drive a session at `version` at all.
pub fn is_supported(version: u32) -> bool {
    (EARLIEST_PROTOCOL_VERSION..=CURRENT_PROTOCOL_VERSION).contains(&version)
}

/// The client release name for a protocol version.
pub fn display_name(version: u32) -> Option<&'static str> {
    VERSION_NAMES
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, name)| *name)
}

/// The client release name for [`CURRENT_PROTOCOL_VERSION`].
pub fn current_display_name() -> &'static str {
    // The table always carries the current version.
    display_name(CURRENT_PROTOCOL_VERSION).unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_range_is_2_through_7() {
        assert!(!is_supported(0));
        assert!(!is_supported(1));
        for version in EARLIEST_PROTOCOL_VERSION..=CURRENT_PROTOCOL_VERSION {
            assert!(is_supported(version), "{version}");
        }
        assert!(!is_supported(CURRENT_PROTOCOL_VERSION + 1));
    }

    #[test]
    fn every_supported_version_has_a_name() {
        for version in EARLIEST_PROTOCOL_VERSION..=CURRENT_PROTOCOL_VERSION {
            assert!(display_name(version).is_some(), "{version}");
        }
        assert_eq!(display_name(8), None);
        assert_eq!(current_display_name(), "0.4.15");
    }
}
