//! Filter builder orchestration
//!
//! Coordinates the build pipeline:
//! 1. Size the filter (counting the input's k-mers if no count was given)
//! 2. Stream records into bounded batches
//! 3. Split each batch into overlapping chunks and insert them in parallel,
//!    one private partial filter per worker, OR-reduced at the end
//! 4. Report fill ratio and estimated false-positive rate

use crate::{
    bloom::{BloomError, BloomFilter, FilterParams},
    builder::{
        chunk::split_chunks,
        config::{BuildConfiguration, ConfigError, Sizing},
        parse::{count_kmers, parse_sequences},
    },
    encoding::EncodingError,
    kmer::count_kmers as count_sequence_kmers,
};
use rayon::prelude::*;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while building a filter
#[derive(Error, Debug)]
pub enum BuildError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Filter construction failed
    #[error(transparent)]
    Filter(#[from] BloomError),
    /// K-mer extraction failed
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// The worker pool could not be started
    #[error("Failed to create thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    /// The sequence source could not be read
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

/// Build the partial filter of one chunk
///
/// Partial filters built from the same `params` combine with
/// [`crate::bloom::merge`] into the filter of the concatenated input.
pub fn build_partial(chunk: &[u8], params: &FilterParams) -> Result<BloomFilter, BloomError> {
    let mut filter = BloomFilter::new(params)?;
    filter.insert_sequence(chunk);
    Ok(filter)
}

/// Insert `chunks` into `filter` using the current rayon pool
///
/// Each worker folds chunks into a private empty copy of `filter`; the
/// copies are OR-reduced and then OR-ed into `filter`. The result does not
/// depend on how rayon schedules the work.
pub fn insert_chunks(filter: &mut BloomFilter, chunks: &[&[u8]]) {
    if chunks.len() <= 1 || rayon::current_num_threads() == 1 {
        for chunk in chunks {
            filter.insert_sequence(chunk);
        }
        return;
    }

    let template: &BloomFilter = filter;
    let combined = chunks
        .par_iter()
        .fold(
            || template.empty_like(),
            |mut partial, chunk| {
                partial.insert_sequence(chunk);
                partial
            },
        )
        .reduce_with(|mut a, b| {
            a.union_with(&b);
            a
        });

    if let Some(partial) = combined {
        filter.union_with(&partial);
    }
}

/// Records buffered for one parallel insertion round
struct SequenceBatch {
    bases: Vec<u8>,
    ends: Vec<usize>,
    capacity: usize,
}

impl SequenceBatch {
    fn new(capacity: usize) -> Self {
        Self {
            bases: Vec::new(),
            ends: Vec::new(),
            capacity,
        }
    }

    fn push(&mut self, seq: &[u8]) {
        self.bases.extend_from_slice(seq);
        self.ends.push(self.bases.len());
    }

    fn is_full(&self) -> bool {
        self.bases.len() >= self.capacity
    }

    fn records(&self) -> impl Iterator<Item = &[u8]> {
        let starts = std::iter::once(0).chain(self.ends.iter().copied());
        starts
            .zip(self.ends.iter().copied())
            .map(|(start, end)| &self.bases[start..end])
    }

    fn clear(&mut self) {
        self.bases.clear();
        self.ends.clear();
    }
}

/// Builder for k-mer Bloom filters
pub struct FilterBuilder {
    config: BuildConfiguration,
}

impl FilterBuilder {
    /// Create a new filter builder with the given configuration
    pub fn new(config: BuildConfiguration) -> Result<Self, BuildError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The build configuration
    pub fn config(&self) -> &BuildConfiguration {
        &self.config
    }

    /// Build a rayon thread pool sized to `config.num_threads`.
    /// `num_threads == 0` means "all cores" (rayon default).
    fn thread_pool(&self) -> Result<rayon::ThreadPool, BuildError> {
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.num_threads)
            .build()?)
    }

    /// Build a filter from a FASTA/FASTQ or plain-text file
    ///
    /// Every record is inserted separately, so no k-mer spans two records.
    ///
    /// # Parallelism
    /// The number of threads is controlled by `config.num_threads`:
    /// - `0`: use all available CPU cores (rayon default)
    /// - `1`: single-threaded (no partial filters)
    /// - `N`: use exactly N threads
    pub fn build_from_file<P: AsRef<Path>>(&self, path: P) -> Result<BloomFilter, BuildError> {
        let path = path.as_ref();
        let pool = self.thread_pool()?;
        pool.install(|| self.build_from_file_inner(path))
    }

    /// Inner build logic, runs inside the rayon thread pool
    fn build_from_file_inner(&self, path: &Path) -> Result<BloomFilter, BuildError> {
        self.config.print();
        info!("Building k-mer Bloom filter from {}", path.display());
        let build_start = Instant::now();

        // Step 1: Size the filter
        let counted = if self.config.needs_kmer_count() {
            info!("Step 1: Counting k-mers to size the filter...");
            let step_start = Instant::now();
            let n = count_kmers(path, self.config.k)?;
            info!("  Counted {} k-mers in {:.2?}", n, step_start.elapsed());
            Some(n)
        } else {
            info!("Step 1: Sizing from configuration");
            None
        };
        let params = self.config.filter_params(counted)?;
        log_params(&params);
        let mut filter = BloomFilter::new(&params)?;

        // Step 2: Stream records and insert their k-mers
        info!("Step 2: Inserting k-mers...");
        let step_start = Instant::now();
        let mut batch = SequenceBatch::new(self.batch_capacity());
        let mut num_sequences = 0usize;
        let mut num_bases = 0usize;
        parse_sequences(path, |id, seq| {
            num_sequences += 1;
            num_bases += seq.len();
            debug!("  record {} ({} bases)", String::from_utf8_lossy(id), seq.len());
            batch.push(seq);
            if batch.is_full() {
                self.insert_batch(&mut filter, &batch);
                batch.clear();
            }
            Ok(())
        })?;
        self.insert_batch(&mut filter, &batch);
        info!(
            "  Inserted {} k-mers from {} sequences ({} bases) in {:.2?}",
            filter.num_inserted(),
            num_sequences,
            num_bases,
            step_start.elapsed()
        );

        self.report(&filter);
        info!("Filter Build Complete in {:.2?}", build_start.elapsed());
        Ok(filter)
    }

    /// Build a filter from in-memory sequences, one record each
    pub fn build_from_sequences<S>(&self, sequences: &[S]) -> Result<BloomFilter, BuildError>
    where
        S: AsRef<[u8]> + Sync,
    {
        let pool = self.thread_pool()?;
        pool.install(|| self.build_from_sequences_inner(sequences))
    }

    fn build_from_sequences_inner<S>(&self, sequences: &[S]) -> Result<BloomFilter, BuildError>
    where
        S: AsRef<[u8]> + Sync,
    {
        let k = self.config.k;
        let counted = if self.config.needs_kmer_count() {
            let counts: Result<Vec<u64>, _> = sequences
                .par_iter()
                .map(|seq| count_sequence_kmers(seq.as_ref(), k))
                .collect();
            Some(counts?.into_iter().sum())
        } else {
            None
        };
        let params = self.config.filter_params(counted)?;
        log_params(&params);
        let mut filter = BloomFilter::new(&params)?;

        let chunks: Vec<&[u8]> = sequences
            .iter()
            .flat_map(|seq| split_chunks(seq.as_ref(), k, self.config.chunk_size))
            .collect();
        debug!("  {} sequences split into {} chunks", sequences.len(), chunks.len());
        insert_chunks(&mut filter, &chunks);

        self.report(&filter);
        Ok(filter)
    }

    fn batch_capacity(&self) -> usize {
        rayon::current_num_threads()
            .max(1)
            .saturating_mul(self.config.chunk_size)
    }

    fn insert_batch(&self, filter: &mut BloomFilter, batch: &SequenceBatch) {
        let k = filter.k();
        let chunks: Vec<&[u8]> = batch
            .records()
            .flat_map(|seq| split_chunks(seq, k, self.config.chunk_size))
            .collect();
        insert_chunks(filter, &chunks);
    }

    /// Log fill statistics and flag a filter worse than its sizing target
    fn report(&self, filter: &BloomFilter) {
        let fill = filter.fill_ratio();
        let estimated = filter.estimated_fp_rate();
        info!("  Bits set: {} / {} ({:.2}%)", filter.count_ones(), filter.num_bits(), fill * 100.0);
        info!("  Estimated false-positive rate: {:.6}", estimated);

        if let Sizing::FalsePositiveRate { rate, .. } = self.config.sizing {
            // 10% slack for sampling noise around the optimum
            if estimated > rate * 1.1 {
                warn!(
                    "Estimated false-positive rate {:.6} exceeds the target {}; the expected k-mer count may be too low",
                    estimated, rate
                );
            }
        }
    }
}

fn log_params(params: &FilterParams) {
    info!(
        "  m = {} bits ({:.2} MB), h = {}, k = {}",
        params.num_bits(),
        params.num_bits() as f64 / (8.0 * 1024.0 * 1024.0),
        params.num_hashes(),
        params.k()
    );
    debug!("  seeds = {:x?}", params.seeds());
}
