//! ATR (Answer To Reset) handling
//!
//! The ATR is only needed while a reset cycle resolves the card system, so
//! this is a thin owned wrapper with just enough ISO 7816-3 parsing for
//! card systems to match on.

use std::fmt;

use crate::core::utils::format_hex_spaced;

/// Direct convention initial character
pub const TS_DIRECT: u8 = 0x3B;
/// Inverse convention initial character
pub const TS_INVERSE: u8 = 0x3F;

/// Maximum ATR length allowed by ISO 7816-3
pub const MAX_ATR_LEN: usize = 33;

/// Power-up response of a card
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Atr(Vec<u8>);

impl Atr {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the initial character is a valid convention byte and the
    /// length is within ISO bounds.
    pub fn has_valid_ts(&self) -> bool {
        matches!(self.0.first(), Some(&TS_DIRECT) | Some(&TS_INVERSE)) && self.0.len() <= MAX_ATR_LEN
    }

    /// Historical bytes, if the interface byte chain can be walked.
    pub fn historical_bytes(&self) -> Option<&[u8]> {
        let t0 = *self.0.get(1)?;
        let hist_len = (t0 & 0x0F) as usize;

        // Walk TA/TB/TC/TD presence bits starting from T0's high nibble
        let mut pos = 2;
        let mut y = t0 >> 4;
        loop {
            let mut td = None;
            for bit in 0..4 {
                if y & (1 << bit) != 0 {
                    if bit == 3 {
                        td = Some(*self.0.get(pos)?);
                    }
                    pos += 1;
                }
            }
            match td {
                Some(td) => y = td >> 4,
                None => break,
            }
        }

        self.0.get(pos..pos + hist_len)
    }
}

impl From<&[u8]> for Atr {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for Atr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_hex_spaced(&self.0))
    }
}
