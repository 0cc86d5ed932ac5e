//! Builder module for constructing k-mer Bloom filters
//!
//! This module implements the build pipeline:
//! 1. Validate the configuration and size the filter
//! 2. Parse sequences (FASTA/FASTQ or plain text)
//! 3. Split records into overlapping chunks
//! 4. Insert chunks in parallel and OR-merge the partial filters

pub mod chunk;
pub mod config;
pub mod filter_builder;
pub mod parse;

pub use config::{BuildConfiguration, ConfigError, Sizing};
pub use filter_builder::{build_partial, insert_chunks, BuildError, FilterBuilder};
pub use parse::parse_sequences;
