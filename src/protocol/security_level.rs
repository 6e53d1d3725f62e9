//! Trust tiers for a session's claimed account identity.

use thiserror::Error;
use uuid::Uuid;

/// How much the server trusts that a session really is the account it claims.
///
/// Ordered: `Insecure < Offline < Secure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// Pre-handshake protocol versions; identity is entirely self-reported.
    Insecure,
    /// Deterministic offline identity derived from the username.
    Offline,
    /// Identity confirmed through the account verification service.
    Secure,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid security level {0}")]
pub struct BadSecurityLevel(pub u8);

impl SecurityLevel {
    /// The level an account id alone can vouch for: version-3 ids are
    /// offline identities, anything else is assumed to have been verified
    /// when it first connected.
    pub fn implied_by(account: Uuid) -> Self {
        if account.get_version_num() == 3 {
            Self::Offline
        } else {
            Self::Secure
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Insecure => 0,
            Self::Offline => 1,
            Self::Secure => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, BadSecurityLevel> {
        match value {
            0 => Ok(Self::Insecure),
            1 => Ok(Self::Offline),
            2 => Ok(Self::Secure),
            other => Err(BadSecurityLevel(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_reflects_trust() {
        assert!(SecurityLevel::Insecure < SecurityLevel::Offline);
        assert!(SecurityLevel::Offline < SecurityLevel::Secure);
    }

    #[test]
    fn round_trips_through_wire_byte() {
        for level in [
            SecurityLevel::Insecure,
            SecurityLevel::Offline,
            SecurityLevel::Secure,
        ] {
            assert_eq!(SecurityLevel::from_u8(level.as_u8()), Ok(level));
        }
        assert_eq!(SecurityLevel::from_u8(3), Err(BadSecurityLevel(3)));
    }

    #[test]
    fn v3_accounts_imply_offline() {
        let offline = Uuid::from_u128(0x0000_0000_0000_3000_8000_0000_0000_0000);
        assert_eq!(offline.get_version_num(), 3);
        assert_eq!(SecurityLevel::implied_by(offline), SecurityLevel::Offline);
        assert_eq!(SecurityLevel::implied_by(Uuid::new_v4()), SecurityLevel::Secure);
    }
}
