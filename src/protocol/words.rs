//! The fixed word dictionary behind the human-readable connection id form.
//!
//! Each word carries exactly [`WORD_BITS`] bits, so an id is three words. The
//! dictionary is generated from fixed letter tables rather than shipped as an
//! asset: every word is five lowercase letters in consonant-vowel alternation
//! (`bakan`, `topir`, ...), which keeps the words pronounceable and the
//! mapping trivially bijective. Both encode and decode happen in this
//! process, so the concrete word set only has to be stable within a build.

/// Bits of the connection id carried by a single word.
pub const WORD_BITS: u32 = 14;

/// Number of words in the dictionary (`2^WORD_BITS`).
pub const WORD_COUNT: usize = 1 << WORD_BITS;

/// Length in bytes of every dictionary word.
pub const WORD_LEN: usize = 5;

const ONSETS: &[u8; 16] = b"bdfghklmnprstvwz";
const VOWELS: &[u8; 4] = b"aeio";
const FINALS: &[u8; 4] = b"lnrs";

/// Returns the dictionary word at `index`.
///
/// Only the low [`WORD_BITS`] bits of `index` are used; higher bits are
/// masked off so the function is total.
pub fn word(index: u16) -> String {
    let index = usize::from(index) & (WORD_COUNT - 1);
    // SAFETY: each position is masked to the table's index range above.
    #[allow(clippy::indexing_slicing)]
    let letters = [
        ONSETS[(index >> 10) & 0xf],
        VOWELS[(index >> 8) & 0x3],
        ONSETS[(index >> 4) & 0xf],
        VOWELS[(index >> 2) & 0x3],
        FINALS[index & 0x3],
    ];
    letters.iter().map(|&b| char::from(b)).collect()
}

/// Looks up the index of `word`, ignoring ASCII case.
///
/// Returns `None` for anything that is not exactly a dictionary word.
pub fn index_of(word: &str) -> Option<u16> {
    let bytes = word.as_bytes();
    if bytes.len() != WORD_LEN {
        return None;
    }
    // SAFETY: length is checked to be exactly WORD_LEN above.
    #[allow(clippy::indexing_slicing)]
    let (c1, v1, c2, v2, c3) = (
        position(ONSETS, bytes[0])?,
        position(VOWELS, bytes[1])?,
        position(ONSETS, bytes[2])?,
        position(VOWELS, bytes[3])?,
        position(FINALS, bytes[4])?,
    );
    Some(((c1 << 10) | (v1 << 8) | (c2 << 4) | (v2 << 2) | c3) as u16)
}

fn position(table: &[u8], letter: u8) -> Option<usize> {
    let lower = letter.to_ascii_lowercase();
    table.iter().position(|&b| b == lower)
}
