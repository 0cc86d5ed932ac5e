//! Constants and defaults for kbloom
//!
//! This module defines the default build parameters, the limits enforced
//! when loading a persisted filter, and the on-disk format identifiers.

/// Default k-mer length
pub const DEFAULT_K: usize = 30;

/// Largest supported k-mer length (2 bits per base in a `u64`)
pub const MAX_K: usize = 32;

/// Smallest supported k-mer length
pub const MIN_K: usize = 1;

/// Default target false-positive rate for rate-based sizing
pub const DEFAULT_FP_RATE: f64 = 0.01;

/// Default master seed used to derive the persisted hash seeds
pub const DEFAULT_SEED: u64 = 0x6b62_6c6f_6f6d_2d31;

/// Default number of bases per genome chunk handed to one worker
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Upper bound on the number of hash functions accepted in a header.
///
/// Anything larger is treated as a corrupt header rather than allocated.
pub const MAX_HASHES: u32 = 64;

/// Magic bytes at the start of every persisted filter
pub const MAGIC: &[u8; 8] = b"KBLOOM01";

/// File format version: (major, minor)
pub const FORMAT_VERSION: (u32, u32) = (1, 0);

/// Crate version
pub const VERSION: (u8, u8, u8) = (0, 1, 0);

/// Check if a k-mer length is supported
#[inline]
pub const fn is_valid_k(k: usize) -> bool {
    k >= MIN_K && k <= MAX_K
}

/// Number of bytes needed to hold `bits` bits
#[inline]
pub const fn bytes_for_bits(bits: u64) -> u64 {
    bits.div_ceil(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_k() {
        assert!(is_valid_k(1));
        assert!(is_valid_k(DEFAULT_K));
        assert!(is_valid_k(32));

        assert!(!is_valid_k(0));
        assert!(!is_valid_k(33));
        assert!(!is_valid_k(64));
    }

    #[test]
    fn test_bytes_for_bits() {
        assert_eq!(bytes_for_bits(0), 0);
        assert_eq!(bytes_for_bits(1), 1);
        assert_eq!(bytes_for_bits(8), 1);
        assert_eq!(bytes_for_bits(9), 2);
        assert_eq!(bytes_for_bits(64), 8);
    }
}
