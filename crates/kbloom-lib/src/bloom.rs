//! Bloom filter over canonical k-mer keys
//!
//! The bit array is stored exactly as it is persisted: bit `i` lives in byte
//! `i / 8` under mask `0x80 >> (i % 8)`. Bits are only ever set, never
//! cleared, so a negative answer from [`BloomFilter::contains`] is exact and a
//! positive one is probabilistic.
//!
//! Filters built with identical [`FilterParams`] combine by bitwise OR
//! ([`BloomFilter::merge`]), which is what makes chunked parallel
//! construction possible.

use crate::constants::{bytes_for_bits, is_valid_k, MAX_HASHES};
use crate::hasher::{derive_seeds, HashFamily};
use crate::kmer::CanonicalKmers;
use std::f64::consts::LN_2;
use thiserror::Error;

/// Errors raised when creating or combining filters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BloomError {
    /// k outside the supported range
    #[error("Invalid k-mer length {0}, must be in [1, 32]")]
    InvalidK(usize),
    /// m == 0
    #[error("Bit array size must be positive")]
    ZeroBits,
    /// h == 0 or h > MAX_HASHES
    #[error("Number of hash functions must be in [1, {max}], got {0}", max = MAX_HASHES)]
    InvalidHashCount(usize),
    /// Target false-positive rate outside (0, 1)
    #[error("False-positive rate must be in (0, 1), got {0}")]
    InvalidRate(f64),
    /// Rate-based sizing with nothing to insert
    #[error("Expected number of k-mers must be positive for rate-based sizing")]
    ZeroCapacity,
    /// The bit array cannot be allocated on this platform
    #[error("Bit array of {0} bits is too large for this platform")]
    TooLarge(u64),
    /// Raw bytes do not match the declared bit count
    #[error("Bit array length mismatch: expected {expected} bytes, got {actual}")]
    BitsLength {
        /// Bytes required for m bits
        expected: u64,
        /// Bytes supplied
        actual: u64,
    },
    /// Padding bits past m are set
    #[error("Bit array has bits set beyond position {0}")]
    DirtyPadding(u64),
    /// Merge of filters with different (k, m, h, seeds)
    #[error("Filters are not compatible: {0}")]
    ParameterMismatch(String),
}

/// Optimal number of bits for `n` items at false-positive rate `p`:
/// `ceil(-n * ln(p) / (ln 2)^2)`
pub fn optimal_num_bits(n: u64, p: f64) -> u64 {
    (-(n as f64) * p.ln() / (LN_2 * LN_2)).ceil() as u64
}

/// Optimal number of hash functions for `m` bits and `n` items:
/// `round((m / n) * ln 2)`, at least 1 and at most [`MAX_HASHES`]
pub fn optimal_num_hashes(m: u64, n: u64) -> usize {
    let h = ((m as f64 / n.max(1) as f64) * LN_2).round() as u64;
    h.clamp(1, MAX_HASHES as u64) as usize
}

/// Everything that must agree between filters for them to be combined,
/// and between build and query for answers to mean anything
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterParams {
    k: usize,
    num_bits: u64,
    seeds: Vec<u64>,
}

impl FilterParams {
    /// Explicit `(m, h)` with seeds derived from `master_seed`
    pub fn new(k: usize, num_bits: u64, num_hashes: usize, master_seed: u64) -> Result<Self, BloomError> {
        if num_hashes == 0 || num_hashes > MAX_HASHES as usize {
            return Err(BloomError::InvalidHashCount(num_hashes));
        }
        Self::with_seeds(k, num_bits, derive_seeds(master_seed, num_hashes))
    }

    /// Explicit `(m, seeds)`; `h` is the number of seeds
    pub fn with_seeds(k: usize, num_bits: u64, seeds: Vec<u64>) -> Result<Self, BloomError> {
        if !is_valid_k(k) {
            return Err(BloomError::InvalidK(k));
        }
        if num_bits == 0 {
            return Err(BloomError::ZeroBits);
        }
        if seeds.is_empty() || seeds.len() > MAX_HASHES as usize {
            return Err(BloomError::InvalidHashCount(seeds.len()));
        }
        Ok(Self { k, num_bits, seeds })
    }

    /// Size for `expected_kmers` insertions at false-positive rate `fp_rate`
    pub fn for_capacity(
        k: usize,
        expected_kmers: u64,
        fp_rate: f64,
        master_seed: u64,
    ) -> Result<Self, BloomError> {
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(BloomError::InvalidRate(fp_rate));
        }
        if expected_kmers == 0 {
            return Err(BloomError::ZeroCapacity);
        }
        let m = optimal_num_bits(expected_kmers, fp_rate).max(1);
        let h = optimal_num_hashes(m, expected_kmers);
        Self::new(k, m, h, master_seed)
    }

    /// K-mer length
    pub fn k(&self) -> usize {
        self.k
    }

    /// Bit array size (`m`)
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash functions (`h`)
    pub fn num_hashes(&self) -> usize {
        self.seeds.len()
    }

    /// Persisted hash seeds
    pub fn seeds(&self) -> &[u64] {
        &self.seeds
    }

    /// Expected false-positive rate after `n` insertions:
    /// `(1 - e^(-h n / m))^h`
    pub fn theoretical_fp_rate(&self, n: u64) -> f64 {
        let h = self.num_hashes() as f64;
        (1.0 - (-h * n as f64 / self.num_bits as f64).exp()).powf(h)
    }
}

/// Number of bytes backing `num_bits`, if addressable on this platform
fn byte_len(num_bits: u64) -> Result<usize, BloomError> {
    usize::try_from(bytes_for_bits(num_bits))
        .ok()
        .filter(|&len| len <= isize::MAX as usize)
        .ok_or(BloomError::TooLarge(num_bits))
}

/// A Bloom filter of canonical k-mers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    k: usize,
    hashes: HashFamily,
    bits: Vec<u8>,
    num_inserted: u64,
}

impl BloomFilter {
    /// Create an empty filter
    pub fn new(params: &FilterParams) -> Result<Self, BloomError> {
        let len = byte_len(params.num_bits)?;
        Ok(Self {
            k: params.k,
            hashes: HashFamily::new(params.seeds.clone(), params.num_bits),
            bits: vec![0u8; len],
            num_inserted: 0,
        })
    }

    /// Reassemble a filter from persisted parts, validating the bit array
    pub fn from_parts(params: FilterParams, num_inserted: u64, bits: Vec<u8>) -> Result<Self, BloomError> {
        let expected = bytes_for_bits(params.num_bits);
        if bits.len() as u64 != expected {
            return Err(BloomError::BitsLength {
                expected,
                actual: bits.len() as u64,
            });
        }
        let tail = params.num_bits % 8;
        if tail != 0 {
            let padding_mask = 0xFFu8 >> tail;
            if bits.last().is_some_and(|&b| b & padding_mask != 0) {
                return Err(BloomError::DirtyPadding(params.num_bits));
            }
        }
        Ok(Self {
            k: params.k,
            hashes: HashFamily::new(params.seeds, params.num_bits),
            bits,
            num_inserted,
        })
    }

    /// The parameters this filter was built with
    pub fn params(&self) -> FilterParams {
        FilterParams {
            k: self.k,
            num_bits: self.hashes.num_bits(),
            seeds: self.hashes.seeds().to_vec(),
        }
    }

    /// K-mer length
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Bit array size (`m`)
    #[inline]
    pub fn num_bits(&self) -> u64 {
        self.hashes.num_bits()
    }

    /// Number of hash functions (`h`)
    #[inline]
    pub fn num_hashes(&self) -> usize {
        self.hashes.num_hashes()
    }

    /// Persisted hash seeds
    pub fn seeds(&self) -> &[u64] {
        self.hashes.seeds()
    }

    /// Number of insert calls (approximate after merges, see [`Self::merge`])
    #[inline]
    pub fn num_inserted(&self) -> u64 {
        self.num_inserted
    }

    /// Packed bit array, MSB-first within each byte
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Insert a canonical key
    #[inline]
    pub fn insert(&mut self, key: u64) {
        for pos in self.hashes.positions(key) {
            self.bits[(pos >> 3) as usize] |= 0x80u8 >> (pos & 7);
        }
        self.num_inserted += 1;
    }

    /// Test a canonical key: `false` means definitely absent
    #[inline]
    pub fn contains(&self, key: u64) -> bool {
        self.hashes
            .positions(key)
            .all(|pos| self.bits[(pos >> 3) as usize] & (0x80u8 >> (pos & 7)) != 0)
    }

    /// Insert every valid canonical k-mer of `seq`; returns how many were inserted
    pub fn insert_sequence(&mut self, seq: &[u8]) -> u64 {
        let mut inserted = 0u64;
        // k was validated when the filter was created
        if let Ok(kmers) = CanonicalKmers::new(seq, self.k) {
            for hit in kmers {
                self.insert(hit.code);
                inserted += 1;
            }
        }
        inserted
    }

    /// Check whether `other` was built with the same `(k, m, h, seeds)`
    pub fn is_compatible(&self, other: &BloomFilter) -> bool {
        self.k == other.k && self.hashes == other.hashes
    }

    /// OR `other` into this filter
    ///
    /// The resulting `num_inserted` is the sum of both counts. K-mers present
    /// in both inputs are counted twice, so after merging the count is an
    /// upper bound on distinct insertions rather than an exact figure.
    pub fn merge(&mut self, other: &BloomFilter) -> Result<(), BloomError> {
        if !self.is_compatible(other) {
            return Err(BloomError::ParameterMismatch(format!(
                "(k={}, m={}, h={}) vs (k={}, m={}, h={}){}",
                self.k,
                self.num_bits(),
                self.num_hashes(),
                other.k,
                other.num_bits(),
                other.num_hashes(),
                if self.num_bits() == other.num_bits() && self.num_hashes() == other.num_hashes() {
                    " with different seeds"
                } else {
                    ""
                }
            )));
        }
        self.union_with(other);
        Ok(())
    }

    /// OR without the compatibility check; both sides must share params
    pub(crate) fn union_with(&mut self, other: &BloomFilter) {
        debug_assert!(self.is_compatible(other));
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a |= *b;
        }
        self.num_inserted += other.num_inserted;
    }

    /// An empty filter with the same parameters
    pub fn empty_like(&self) -> BloomFilter {
        BloomFilter {
            k: self.k,
            hashes: self.hashes.clone(),
            bits: vec![0u8; self.bits.len()],
            num_inserted: 0,
        }
    }

    /// Number of set bits
    pub fn count_ones(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Fraction of set bits
    pub fn fill_ratio(&self) -> f64 {
        self.count_ones() as f64 / self.num_bits() as f64
    }

    /// False-positive rate implied by the current fill: `fill_ratio^h`
    pub fn estimated_fp_rate(&self) -> f64 {
        self.fill_ratio().powi(self.num_hashes() as i32)
    }
}

/// Combine two partial filters into a new one
pub fn merge(mut a: BloomFilter, b: &BloomFilter) -> Result<BloomFilter, BloomError> {
    a.merge(b)?;
    Ok(a)
}
