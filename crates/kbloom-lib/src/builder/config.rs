//! Build configuration for filter construction
//!
//! Holds the k-mer length, how the filter is sized, the master seed for the
//! hash family, and resource limits. Everything is validated before any
//! sequence is read.

use crate::bloom::{BloomError, FilterParams};
use crate::constants::{
    is_valid_k, DEFAULT_CHUNK_SIZE, DEFAULT_FP_RATE, DEFAULT_K, DEFAULT_SEED, MAX_HASHES,
};
use thiserror::Error;

/// Invalid build parameters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// k outside [1, 32]
    #[error("k must be in range [1, 32], got k={0}")]
    InvalidK(usize),
    /// Rate outside (0, 1)
    #[error("false-positive rate must be in (0, 1), got {0}")]
    InvalidRate(f64),
    /// Rate-based sizing with an expected count of zero
    #[error("expected number of k-mers must be positive, got 0")]
    ZeroCapacity,
    /// Explicit m of zero
    #[error("number of bits must be positive, got 0")]
    ZeroBits,
    /// Explicit h outside [1, MAX_HASHES]
    #[error("number of hash functions must be in range [1, {max}], got {0}", max = MAX_HASHES)]
    InvalidHashCount(usize),
    /// Chunk size of zero
    #[error("chunk size must be positive")]
    ZeroChunkSize,
    /// Rate-based sizing was asked for parameters without any k-mer count
    #[error("expected number of k-mers is unknown; count the input first or set it explicitly")]
    MissingCapacity,
    /// Parameter derivation failed
    #[error(transparent)]
    Params(#[from] BloomError),
}

/// How the bit array size and hash count are chosen
#[derive(Debug, Clone, PartialEq)]
pub enum Sizing {
    /// Derive `(m, h)` from a target false-positive rate and the number of
    /// k-mers to insert. When `expected_kmers` is `None` the builder counts
    /// the input in a first pass.
    FalsePositiveRate {
        /// Target false-positive rate, in (0, 1)
        rate: f64,
        /// Expected number of insertions
        expected_kmers: Option<u64>,
    },
    /// Use the given `(m, h)` as is
    Explicit {
        /// Bit array size (`m`)
        num_bits: u64,
        /// Number of hash functions (`h`)
        num_hashes: usize,
    },
}

impl Default for Sizing {
    fn default() -> Self {
        Sizing::FalsePositiveRate {
            rate: DEFAULT_FP_RATE,
            expected_kmers: None,
        }
    }
}

/// Configuration parameters for building a filter
#[derive(Debug, Clone)]
pub struct BuildConfiguration {
    /// K-mer length (1..=32)
    pub k: usize,

    /// Sizing policy
    pub sizing: Sizing,

    /// Master seed from which the persisted hash seeds are derived
    pub seed: u64,

    /// Number of threads for parallel operations (0 = all available cores)
    pub num_threads: usize,

    /// Bases per chunk handed to one worker (each chunk also carries k-1
    /// bases of overlap with its successor)
    pub chunk_size: usize,
}

impl Default for BuildConfiguration {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            sizing: Sizing::default(),
            seed: DEFAULT_SEED,
            num_threads: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl BuildConfiguration {
    /// Create a new build configuration with the given k-mer length
    pub fn new(k: usize) -> Result<Self, ConfigError> {
        let config = Self {
            k,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Size for a target false-positive rate
    pub fn with_fp_rate(mut self, rate: f64, expected_kmers: Option<u64>) -> Self {
        self.sizing = Sizing::FalsePositiveRate {
            rate,
            expected_kmers,
        };
        self
    }

    /// Use an explicit `(m, h)`
    pub fn with_explicit_size(mut self, num_bits: u64, num_hashes: usize) -> Self {
        self.sizing = Sizing::Explicit {
            num_bits,
            num_hashes,
        };
        self
    }

    /// Set the master seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the thread count (0 = all cores)
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the chunk size in bases
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_k(self.k) {
            return Err(ConfigError::InvalidK(self.k));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        match self.sizing {
            Sizing::FalsePositiveRate {
                rate,
                expected_kmers,
            } => {
                if !(rate > 0.0 && rate < 1.0) {
                    return Err(ConfigError::InvalidRate(rate));
                }
                if expected_kmers == Some(0) {
                    return Err(ConfigError::ZeroCapacity);
                }
            }
            Sizing::Explicit {
                num_bits,
                num_hashes,
            } => {
                if num_bits == 0 {
                    return Err(ConfigError::ZeroBits);
                }
                if num_hashes == 0 || num_hashes > MAX_HASHES as usize {
                    return Err(ConfigError::InvalidHashCount(num_hashes));
                }
            }
        }
        Ok(())
    }

    /// Whether the input must be counted before the filter can be sized
    pub fn needs_kmer_count(&self) -> bool {
        matches!(
            self.sizing,
            Sizing::FalsePositiveRate {
                expected_kmers: None,
                ..
            }
        )
    }

    /// Fix `(k, m, h, seeds)`.
    ///
    /// `counted_kmers` is used only for rate-based sizing without an
    /// explicit expected count.
    pub fn filter_params(&self, counted_kmers: Option<u64>) -> Result<FilterParams, ConfigError> {
        self.validate()?;
        let params = match self.sizing {
            Sizing::Explicit {
                num_bits,
                num_hashes,
            } => FilterParams::new(self.k, num_bits, num_hashes, self.seed)?,
            Sizing::FalsePositiveRate {
                rate,
                expected_kmers,
            } => {
                let n = expected_kmers
                    .or(counted_kmers)
                    .ok_or(ConfigError::MissingCapacity)?;
                if n == 0 {
                    return Err(ConfigError::ZeroCapacity);
                }
                FilterParams::for_capacity(self.k, n, rate, self.seed)?
            }
        };
        Ok(params)
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Build Configuration:");
        tracing::info!("  k = {}", self.k);
        match self.sizing {
            Sizing::FalsePositiveRate {
                rate,
                expected_kmers,
            } => {
                tracing::info!("  target false-positive rate = {}", rate);
                match expected_kmers {
                    Some(n) => tracing::info!("  expected k-mers = {}", n),
                    None => tracing::info!("  expected k-mers = counted from input"),
                }
            }
            Sizing::Explicit {
                num_bits,
                num_hashes,
            } => {
                tracing::info!("  m = {} bits", num_bits);
                tracing::info!("  h = {}", num_hashes);
            }
        }
        tracing::debug!("  seed = {:#018x}", self.seed);
        if self.num_threads == 0 {
            tracing::info!("  num_threads = all available cores");
        } else {
            tracing::info!("  num_threads = {}", self.num_threads);
        }
        tracing::debug!("  chunk_size = {}", self.chunk_size);
    }
}
