//! DNA nucleotide encoding
//!
//! 2-bit encoding used for every k-mer key:
//! - A (65/97)  -> 00
//! - C (67/99)  -> 01
//! - G (71/103) -> 10
//! - T (84/116) -> 11
//!
//! With this ordering the complement of a base is `bits ^ 0b11`, and the
//! numeric order of packed k-mers equals their lexicographic order.

use thiserror::Error;

/// Error type for encoding operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The input byte is not a valid DNA base (A/C/G/T)
    #[error("Invalid DNA base: {0:?}")]
    InvalidBase(u8),
    /// The requested k-mer length cannot be packed into a `u64`
    #[error("Unsupported k-mer length {0}, must be in [1, 32]")]
    UnsupportedLength(usize),
    /// The input string length does not match the expected k-mer length
    #[error("K-mer length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Expected k-mer length
        expected: usize,
        /// Actual string length
        actual: usize,
    },
}

/// Sentinel in [`BASE_LUT`] for bytes that are not A/C/G/T
pub const INVALID_BASE: u8 = 0xFF;

/// 256-entry lookup table: ASCII -> 2-bit code, [`INVALID_BASE`] otherwise.
pub static BASE_LUT: [u8; 256] = {
    let mut t = [INVALID_BASE; 256];
    t[b'A' as usize] = 0b00;
    t[b'a' as usize] = 0b00;
    t[b'C' as usize] = 0b01;
    t[b'c' as usize] = 0b01;
    t[b'G' as usize] = 0b10;
    t[b'g' as usize] = 0b10;
    t[b'T' as usize] = 0b11;
    t[b't' as usize] = 0b11;
    t
};

/// Encode a single DNA nucleotide to 2 bits
#[inline]
pub fn encode_base(base: u8) -> Result<u8, EncodingError> {
    match BASE_LUT[base as usize] {
        INVALID_BASE => Err(EncodingError::InvalidBase(base)),
        bits => Ok(bits),
    }
}

/// Decode a 2-bit value to DNA nucleotide (uppercase)
#[inline]
pub const fn decode_base(bits: u8) -> u8 {
    match bits & 0b11 {
        0b00 => b'A',
        0b01 => b'C',
        0b10 => b'G',
        _ => b'T',
    }
}

/// Get the complement of a DNA base (encoded)
#[inline]
pub const fn complement_base(bits: u8) -> u8 {
    bits ^ 0b11
}
