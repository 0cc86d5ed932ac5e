// kbloom: k-mer Bloom filters for genome membership scoring
//
// Builds a Bloom filter over the canonical k-mers of a reference genome and
// scores query samples by the fraction of their k-mers it contains.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod bloom;
pub mod builder;
pub mod constants;
pub mod encoding;
pub mod hasher;
pub mod kmer;
pub mod query;
pub mod serialization;

// Re-export common types at crate root
pub use bloom::{merge, BloomError, BloomFilter, FilterParams};
pub use builder::{build_partial, BuildConfiguration, BuildError, ConfigError, FilterBuilder, Sizing};
pub use encoding::EncodingError;
pub use kmer::{canonical_kmer, CanonicalKmers, KmerHit};
pub use query::{QueryEngine, QueryResult, SampleReport, Score};
pub use serialization::{load, save, SerializationError};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let (major, minor, patch) = version();
        assert_eq!(major, 0);
        assert_eq!(minor, 1);
        assert_eq!(patch, 0);
    }
}
