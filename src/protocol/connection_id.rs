//! 42-bit session identifiers and their two textual forms.
//!
//! A connection id is chosen by the client and kept for the life of the
//! session. On the wire it travels as a plain integer; to humans it is shown
//! either as three dictionary words (`bakan-topir-havel`, 14 bits per word,
//! first word least significant) or as nine base-36 digits.

use crate::protocol::words;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest valid connection id (inclusive).
pub const MAX_CONNECTION_ID: u64 = (1 << 42) - 1;

/// Number of words in the mnemonic form.
pub const WORDS_PER_ID: usize = 3;

/// Number of digits in the base-36 short form.
pub const SHORT_ID_DIGITS: usize = 9;

/// A session identifier in `[0, 2^42)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionIdError {
    #[error("connection id {0} is out of range")]
    OutOfRange(u64),
    #[error("invalid connection id word `{0}`")]
    InvalidWord(String),
    #[error("expected {WORDS_PER_ID} connection id words, got {0}")]
    WrongWordCount(usize),
    #[error("expected a {SHORT_ID_DIGITS} digit short connection id, found {0} characters")]
    ShortLength(usize),
    #[error("invalid short connection id `{0}`")]
    InvalidShort(String),
}

impl ConnectionId {
    /// Wraps a raw id, rejecting values outside the 42-bit range.
    pub fn new(raw: u64) -> Result<Self, ConnectionIdError> {
        if raw > MAX_CONNECTION_ID {
            return Err(ConnectionIdError::OutOfRange(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Renders the three-word mnemonic form, words joined by `-`.
    pub fn to_words(self) -> String {
        let mut out = String::with_capacity(WORDS_PER_ID * (words::WORD_LEN + 1));
        for i in 0..WORDS_PER_ID {
            if i > 0 {
                out.push('-');
            }
            let index = (self.0 >> (words::WORD_BITS as usize * i)) & ((1 << words::WORD_BITS) - 1);
            out.push_str(&words::word(index as u16));
        }
        out
    }

    /// Parses the three-word mnemonic form; word matching ignores ASCII case.
    pub fn from_words(s: &str) -> Result<Self, ConnectionIdError> {
        let mut raw = 0u64;
        let mut count = 0usize;
        for (i, part) in s.split('-').enumerate() {
            if i >= WORDS_PER_ID {
                return Err(ConnectionIdError::WrongWordCount(s.split('-').count()));
            }
            let index = words::index_of(part)
                .ok_or_else(|| ConnectionIdError::InvalidWord(part.to_string()))?;
            raw |= u64::from(index) << (words::WORD_BITS as usize * i);
            count = i + 1;
        }
        if count != WORDS_PER_ID {
            return Err(ConnectionIdError::WrongWordCount(count));
        }
        Ok(Self(raw))
    }

    /// Renders the nine-digit base-36 short form, zero padded, lowercase.
    pub fn to_short(self) -> String {
        const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut buf = [b'0'; SHORT_ID_DIGITS];
        let mut rest = self.0;
        for slot in buf.iter_mut().rev() {
            // SAFETY: rest % 36 is always within the digit table.
            #[allow(clippy::indexing_slicing)]
            let digit = DIGITS[(rest % 36) as usize];
            *slot = digit;
            rest /= 36;
        }
        buf.iter().map(|&b| char::from(b)).collect()
    }

    /// Parses the base-36 short form (either letter case). The short form
    /// is always exactly nine digits; anything shorter is some other string
    /// that happens to be base-36, not a connection id.
    pub fn from_short(s: &str) -> Result<Self, ConnectionIdError> {
        if s.len() != SHORT_ID_DIGITS {
            return Err(ConnectionIdError::ShortLength(s.len()));
        }
        let raw = u64::from_str_radix(s, 36)
            .map_err(|_| ConnectionIdError::InvalidShort(s.to_string()))?;
        Self::new(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_words())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({} \"{}\")", self.0, self.to_words())
    }
}

impl FromStr for ConnectionId {
    type Err = ConnectionIdError;

    /// Accepts either textual form: strings containing `-` parse as words,
    /// everything else as the base-36 short form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('-') {
            Self::from_words(s)
        } else {
            Self::from_short(s)
        }
    }
}
