//! K-mer packing, reverse complement and canonicalization
//!
//! K-mers are packed two bits per base into the low `2k` bits of a `u64`,
//! first base in the most significant position. The canonical form of a
//! k-mer is the numerically smaller of its forward and reverse-complement
//! packings, so both strands of the same locus map to one key.
//!
//! [`CanonicalKmers`] slides a window across a sequence and maintains the
//! forward and reverse-complement packings incrementally. Any byte outside
//! `ACGTacgt` resets the window: no k-mer overlapping it is emitted.

use crate::constants::is_valid_k;
use crate::encoding::{complement_base, decode_base, encode_base, EncodingError, BASE_LUT, INVALID_BASE};

/// Mask selecting the low `2k` bits
#[inline]
pub const fn kmer_mask(k: usize) -> u64 {
    if k >= 32 {
        u64::MAX
    } else {
        (1u64 << (2 * k)) - 1
    }
}

/// Pack a window of bases into its forward encoding
///
/// # Errors
/// Returns an error if the window length is outside `[1, 32]` or if it
/// contains a byte that is not a DNA base.
pub fn encode_kmer(window: &[u8]) -> Result<u64, EncodingError> {
    if !is_valid_k(window.len()) {
        return Err(EncodingError::UnsupportedLength(window.len()));
    }
    let mut code = 0u64;
    for &base in window {
        code = (code << 2) | encode_base(base)? as u64;
    }
    Ok(code)
}

/// Reverse-complement a packed k-mer (low `2k` bits used)
#[inline]
pub fn reverse_complement(code: u64, k: usize) -> u64 {
    debug_assert!(is_valid_k(k));
    // Complement every base, then reverse the order of the 32 two-bit groups.
    let mut x = !code;
    x = ((x >> 2) & 0x3333_3333_3333_3333) | ((x & 0x3333_3333_3333_3333) << 2);
    x = ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0F) | ((x & 0x0F0F_0F0F_0F0F_0F0F) << 4);
    x = x.swap_bytes();
    x >> (64 - 2 * k)
}

/// Canonical form of a packed k-mer
#[inline]
pub fn canonical(code: u64, k: usize) -> u64 {
    code.min(reverse_complement(code, k))
}

/// Pack a window and return its canonical encoding
pub fn canonical_kmer(window: &[u8]) -> Result<u64, EncodingError> {
    let code = encode_kmer(window)?;
    Ok(canonical(code, window.len()))
}

/// Parse a k-mer string of an expected length and return its canonical key
pub fn parse_kmer(kmer: &str, k: usize) -> Result<u64, EncodingError> {
    if kmer.len() != k {
        return Err(EncodingError::LengthMismatch {
            expected: k,
            actual: kmer.len(),
        });
    }
    canonical_kmer(kmer.as_bytes())
}

/// Decode a packed k-mer back to its (uppercase) bases
pub fn decode_kmer(code: u64, k: usize) -> String {
    (0..k)
        .map(|i| decode_base((code >> (2 * (k - 1 - i))) as u8) as char)
        .collect()
}

/// Incremental canonicalizer fed one base at a time
///
/// Keeps the forward and reverse-complement packings of the last `k` valid
/// bases. Used directly when bases arrive in pieces, and by
/// [`CanonicalKmers`] over a slice.
#[derive(Clone, Debug)]
pub struct KmerScanner {
    k: usize,
    mask: u64,
    rc_shift: usize,
    fwd: u64,
    rc: u64,
    len: usize,
}

impl KmerScanner {
    /// Create a scanner for k-mers of length `k`
    pub fn new(k: usize) -> Result<Self, EncodingError> {
        if !is_valid_k(k) {
            return Err(EncodingError::UnsupportedLength(k));
        }
        Ok(Self {
            k,
            mask: kmer_mask(k),
            rc_shift: 2 * (k - 1),
            fwd: 0,
            rc: 0,
            len: 0,
        })
    }

    /// K-mer length
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Forget the current window (start of a new sequence)
    #[inline]
    pub fn reset(&mut self) {
        self.fwd = 0;
        self.rc = 0;
        self.len = 0;
    }

    /// Push one base; returns the canonical key once a full valid window
    /// ends at this base
    #[inline]
    pub fn push(&mut self, base: u8) -> Option<u64> {
        let v = BASE_LUT[base as usize];
        if v == INVALID_BASE {
            self.reset();
            return None;
        }
        self.fwd = ((self.fwd << 2) | v as u64) & self.mask;
        self.rc = (self.rc >> 2) | ((complement_base(v) as u64) << self.rc_shift);
        if self.len < self.k {
            self.len += 1;
        }
        if self.len == self.k {
            Some(self.fwd.min(self.rc))
        } else {
            None
        }
    }
}

/// A canonical k-mer and the offset of its first base in the input
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KmerHit {
    /// 0-based start position of the window
    pub position: usize,
    /// Canonical 2-bit packed key
    pub code: u64,
}

/// Lazy iterator over the canonical k-mers of a sequence
///
/// Restartable: a new iterator over the same slice yields the same keys.
pub struct CanonicalKmers<'a> {
    seq: &'a [u8],
    next: usize,
    scanner: KmerScanner,
}

impl<'a> CanonicalKmers<'a> {
    /// Create an iterator over the canonical k-mers of `seq`
    pub fn new(seq: &'a [u8], k: usize) -> Result<Self, EncodingError> {
        Ok(Self {
            seq,
            next: 0,
            scanner: KmerScanner::new(k)?,
        })
    }
}

impl Iterator for CanonicalKmers<'_> {
    type Item = KmerHit;

    #[inline]
    fn next(&mut self) -> Option<KmerHit> {
        while self.next < self.seq.len() {
            let i = self.next;
            self.next += 1;
            if let Some(code) = self.scanner.push(self.seq[i]) {
                return Some(KmerHit {
                    position: i + 1 - self.scanner.k(),
                    code,
                });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.seq.len() - self.next))
    }
}

/// Number of valid k-mers in a sequence
pub fn count_kmers(seq: &[u8], k: usize) -> Result<u64, EncodingError> {
    Ok(CanonicalKmers::new(seq, k)?.count() as u64)
}
