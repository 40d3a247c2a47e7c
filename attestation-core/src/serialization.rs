//! Canonical CBOR serialization for deterministic hashing.
//!
//! Anything that feeds a digest (the security flags inside the state hash, the
//! binary checkpoint form) goes through here so that every implementation
//! produces the same bytes.
//!
//! ## Canonicalization Rules
//! 1. Struct fields are emitted as a definite-length map in declaration order,
//!    not the RFC 8949 Section 4.2.1 sorted key order
//! 2. Integers and lengths use the shortest encoding (RFC 8949 Section 4.2.1)
//! 3. No floating point in hashed structures
//! 4. No indefinite-length items

use serde::{Deserialize, Serialize};
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("CBOR encoding error: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("CBOR decoding error: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Non-canonical CBOR: {0}")]
    NonCanonical(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SerializationError>;

/// Serialize a value to canonical CBOR bytes.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    verify_canonical(&buf)?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes, rejecting non-canonical input.
///
/// The decoded value must re-encode to exactly `bytes`, which also pins map
/// keys to declaration order.
pub fn from_canonical_cbor<T>(bytes: &[u8]) -> Result<T>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    verify_canonical(bytes)?;
    let value: T = ciborium::from_reader(bytes)?;
    if to_canonical_cbor(&value)? != bytes {
        return Err(SerializationError::NonCanonical("map key order"));
    }
    Ok(value)
}

/// Check that `bytes` holds exactly one canonical CBOR item.
pub fn verify_canonical(bytes: &[u8]) -> Result<()> {
    let mut cursor = std::io::Cursor::new(bytes);
    verify_item(&mut cursor)?;
    if cursor.position() as usize != bytes.len() {
        return Err(SerializationError::NonCanonical("trailing bytes"));
    }
    Ok(())
}

/// Read an item head: major type plus its argument.
fn read_head<R: Read>(reader: &mut R) -> Result<(u8, u64)> {
    let mut initial = [0u8; 1];
    reader.read_exact(&mut initial)?;

    let major = initial[0] >> 5;
    let info = initial[0] & 0x1F;

    let (arg, minimum) = match info {
        0..=23 => return Ok((major, u64::from(info))),
        24 => {
            let mut b = [0u8; 1];
            reader.read_exact(&mut b)?;
            (u64::from(b[0]), 24)
        }
        25 => {
            let mut b = [0u8; 2];
            reader.read_exact(&mut b)?;
            (u64::from(u16::from_be_bytes(b)), 0x100)
        }
        26 => {
            let mut b = [0u8; 4];
            reader.read_exact(&mut b)?;
            (u64::from(u32::from_be_bytes(b)), 0x1_0000)
        }
        27 => {
            let mut b = [0u8; 8];
            reader.read_exact(&mut b)?;
            (u64::from_be_bytes(b), 0x1_0000_0000)
        }
        31 => return Err(SerializationError::NonCanonical("indefinite-length item")),
        _ => return Err(SerializationError::NonCanonical("reserved additional info")),
    };

    // Major type 7 with info 25..27 carries floats, whose width is not a length.
    if major != 7 && arg < minimum {
        return Err(SerializationError::NonCanonical("non-minimal integer"));
    }
    Ok((major, arg))
}

fn verify_item<R: Read>(reader: &mut R) -> Result<()> {
    let (major, arg) = read_head(reader)?;

    match major {
        2 | 3 => {
            let mut content = (&mut *reader).take(arg);
            let skipped = std::io::copy(&mut content, &mut std::io::sink())?;
            if skipped != arg {
                return Err(SerializationError::NonCanonical("truncated string"));
            }
        }
        4 => {
            for _ in 0..arg {
                verify_item(reader)?;
            }
        }
        5 => {
            for _ in 0..arg {
                verify_item(reader)?;
                verify_item(reader)?;
            }
        }
        6 => verify_item(reader)?,
        _ => {}
    }

    Ok(())
}
