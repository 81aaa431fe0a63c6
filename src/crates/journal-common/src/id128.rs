//! 128-bit identifiers.
//!
//! File ids, sequence-number lineages, machine ids and boot ids are all
//! stored as raw 16-byte values. Their canonical textual form is 32 lowercase
//! hex characters without separators; the dashed form is accepted on input.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Id128Error {
    #[error("invalid 128-bit id length {0}")]
    InvalidLength(usize),

    #[error("invalid character at position {0}")]
    InvalidCharacter(usize),
}

const DASH_POSITIONS: [usize; 4] = [8, 13, 18, 23];

/// Parses a 128-bit id from either its 32-character form or the 36-character
/// form with dashes at positions 8, 13, 18 and 23.
pub fn parse(s: &str) -> Result<Uuid, Id128Error> {
    let input = s.as_bytes();
    let dashed = match input.len() {
        32 => false,
        36 => true,
        n => return Err(Id128Error::InvalidLength(n)),
    };

    let mut bytes = [0u8; 16];
    let mut pos = 0;

    for byte in bytes.iter_mut() {
        if dashed && DASH_POSITIONS.contains(&pos) {
            if input[pos] != b'-' {
                return Err(Id128Error::InvalidCharacter(pos));
            }
            pos += 1;
        }

        let hi = hex_value(input[pos]).ok_or(Id128Error::InvalidCharacter(pos))?;
        let lo = hex_value(input[pos + 1]).ok_or(Id128Error::InvalidCharacter(pos + 1))?;
        *byte = (hi << 4) | lo;
        pos += 2;
    }

    Ok(Uuid::from_bytes(bytes))
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Formats an id as 32 lowercase hex characters.
pub fn to_hex(id: &Uuid) -> String {
    id.simple().to_string()
}

/// Generates a random (version 4) id.
pub fn random() -> Uuid {
    Uuid::new_v4()
}

pub fn is_null(id: &Uuid) -> bool {
    id.is_nil()
}
