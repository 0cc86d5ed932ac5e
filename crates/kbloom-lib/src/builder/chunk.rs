//! Partitioning of a record into overlapping chunks
//!
//! Chunk `c` covers bases `[c * size, c * size + size + k - 1)`, clipped to
//! the record. Every k-mer window starts in exactly one chunk's first `size`
//! bases and ends within that same chunk, so a window is never split and
//! never fully contained in two chunks.

use std::ops::Range;

/// Byte ranges of the chunks of a `len`-base record
///
/// Trailing pieces shorter than `k` hold no window and are dropped, as are
/// records shorter than `k`.
pub fn chunk_ranges(len: usize, k: usize, chunk_size: usize) -> Vec<Range<usize>> {
    debug_assert!(k > 0 && chunk_size > 0);
    if len < k {
        return Vec::new();
    }
    (0..len)
        .step_by(chunk_size)
        .map(|start| start..start.saturating_add(chunk_size).saturating_add(k - 1).min(len))
        .filter(|range| range.len() >= k)
        .collect()
}

/// Split `seq` into chunks for parallel insertion
pub fn split_chunks(seq: &[u8], k: usize, chunk_size: usize) -> Vec<&[u8]> {
    chunk_ranges(seq.len(), k, chunk_size)
        .into_iter()
        .map(|range| &seq[range])
        .collect()
}
