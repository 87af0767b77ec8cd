// ABOUTME: Log sequence numbers - opaque, totally ordered positions in a change log
// ABOUTME: Fixed-width 10-byte values compared as big-endian unsigned integers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Width in bytes of a concrete LSN (`BINARY(10)` in SQL Server CDC).
pub const LSN_WIDTH: usize = 10;

const UNSET_TEXT: &str = "unset";

/// A position in the source's change stream.
///
/// `Unset` means "no prior checkpoint" and orders below every concrete LSN.
/// Concrete values are only ever compared, never subtracted or incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Lsn {
    #[default]
    Unset,
    At([u8; LSN_WIDTH]),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LsnParseError {
    #[error("LSN '{0}' contains non-hex characters")]
    InvalidHex(String),
    #[error("LSN '{0}' is wider than 10 bytes")]
    TooWide(String),
}

impl Lsn {
    /// Build an LSN from raw bytes, left-padding values narrower than [`LSN_WIDTH`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LsnParseError> {
        // Leading zero bytes beyond the fixed width carry no information.
        let significant: &[u8] = match bytes.iter().position(|b| *b != 0) {
            Some(first) => &bytes[first..],
            None => &[],
        };
        if significant.len() > LSN_WIDTH {
            return Err(LsnParseError::TooWide(hex_upper(bytes)));
        }
        let mut out = [0u8; LSN_WIDTH];
        out[LSN_WIDTH - significant.len()..].copy_from_slice(significant);
        Ok(Lsn::At(out))
    }

    /// Parse the text form: optional `0x` prefix, up to 20 hex digits, or `unset`.
    pub fn parse_hex(text: &str) -> Result<Self, LsnParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNSET_TEXT) {
            return Ok(Lsn::Unset);
        }
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LsnParseError::InvalidHex(text.to_string()));
        }

        let padded = if digits.len() % 2 == 1 {
            format!("0{digits}")
        } else {
            digits.to_string()
        };
        let bytes = padded
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                let pair = std::str::from_utf8(pair)
                    .map_err(|_| LsnParseError::InvalidHex(text.to_string()))?;
                u8::from_str_radix(pair, 16).map_err(|_| LsnParseError::InvalidHex(text.to_string()))
            })
            .collect::<Result<Vec<u8>, _>>()?;

        Lsn::from_bytes(&bytes).map_err(|_| LsnParseError::TooWide(text.to_string()))
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Lsn::Unset)
    }

    pub fn as_bytes(&self) -> Option<&[u8; LSN_WIDTH]> {
        match self {
            Lsn::Unset => None,
            Lsn::At(bytes) => Some(bytes),
        }
    }
}

/// Places a counter in the low-order bytes. Intended for tests and fixtures;
/// it does not make LSNs arithmetic.
impl From<u64> for Lsn {
    fn from(position: u64) -> Self {
        let mut out = [0u8; LSN_WIDTH];
        out[LSN_WIDTH - 8..].copy_from_slice(&position.to_be_bytes());
        Lsn::At(out)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lsn::Unset => f.write_str(UNSET_TEXT),
            Lsn::At(bytes) => write!(f, "0x{}", hex_upper(bytes)),
        }
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lsn::parse_hex(s)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Lsn::parse_hex(&text).map_err(serde::de::Error::custom)
    }
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
