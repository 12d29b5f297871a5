//! Bit and byte-mask primitives for the 32-bit words of the wire format
//!
//! Every parser reads the Basic Header Segment as big-endian 32-bit words and
//! extracts its fields with the masks and shifts defined here. Reserved fields
//! must be checked with [`is_reserved`]; a non-zero reserved field is a
//! protocol violation that carries the offending field name, never silently
//! ignored.

use crate::error::{IscsiError, Result};

/// Mask for the most significant byte of a 32-bit word.
pub const FIRST_BYTE_MASK: u32 = 0xFF00_0000;
/// Mask for the second byte of a 32-bit word.
pub const SECOND_BYTE_MASK: u32 = 0x00FF_0000;
/// Mask for the third byte of a 32-bit word.
pub const THIRD_BYTE_MASK: u32 = 0x0000_FF00;
/// Mask for the least significant byte of a 32-bit word.
pub const FOURTH_BYTE_MASK: u32 = 0x0000_00FF;

/// Mask for the two most significant bytes.
pub const FIRST_TWO_BYTES_MASK: u32 = 0xFFFF_0000;
/// Mask for the two least significant bytes.
pub const LAST_TWO_BYTES_MASK: u32 = 0x0000_FFFF;
/// Mask for the three least significant bytes (DataSegmentLength).
pub const LAST_THREE_BYTES_MASK: u32 = 0x00FF_FFFF;

/// Bit shift to the most significant byte.
pub const ONE_BYTE_SHIFT: u32 = 8;
pub const TWO_BYTES_SHIFT: u32 = 16;
pub const THREE_BYTES_SHIFT: u32 = 24;

/// Extracts the most significant byte of a word.
#[inline]
pub fn first_byte(word: u32) -> u8 {
    ((word & FIRST_BYTE_MASK) >> THREE_BYTES_SHIFT) as u8
}

/// Extracts the second byte of a word.
#[inline]
pub fn second_byte(word: u32) -> u8 {
    ((word & SECOND_BYTE_MASK) >> TWO_BYTES_SHIFT) as u8
}

/// Extracts the third byte of a word.
#[inline]
pub fn third_byte(word: u32) -> u8 {
    ((word & THIRD_BYTE_MASK) >> ONE_BYTE_SHIFT) as u8
}

/// Extracts the least significant byte of a word.
#[inline]
pub fn fourth_byte(word: u32) -> u8 {
    (word & FOURTH_BYTE_MASK) as u8
}

/// Fails with a [`IscsiError::ProtocolViolation`] naming `field` if the given
/// reserved field is not zero.
pub fn is_reserved(field: &str, value: u32) -> Result<()> {
    if value != 0 {
        return Err(IscsiError::violation(format!(
            "reserved field {} must be zero, got 0x{:08x}",
            field, value
        )));
    }
    Ok(())
}

/// Fails with a [`IscsiError::ProtocolViolation`] naming `field` if the value
/// differs from the expected one.
pub fn is_expected(field: &str, value: u32, expected: u32) -> Result<()> {
    if value != expected {
        return Err(IscsiError::violation(format!(
            "field {} expected 0x{:08x}, got 0x{:08x}",
            field, expected, value
        )));
    }
    Ok(())
}
