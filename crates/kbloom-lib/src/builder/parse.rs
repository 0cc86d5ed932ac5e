//! Sequence input: FASTA/FASTQ or plain text, optionally gzip-compressed
//!
//! FASTA/FASTQ is read with needletail. A file whose first non-blank byte
//! (after decompression) is neither `>` nor `@` is read as plain text, one
//! sequence per non-empty line. Sequences are passed through unchanged:
//! lower-case bases and ambiguity codes are handled by the canonicalizer.

use crate::kmer::count_kmers as count_sequence_kmers;
use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use needletail::parse_fastx_file;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Layout of a sequence file, decided from its first decompressed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceFormat {
    /// FASTA or FASTQ
    Fastx,
    /// One sequence per line, no headers
    PlainText,
    /// Nothing but whitespace
    Empty,
}

/// Open `path` for reading, decompressing gzip input
pub fn open_reader<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open sequence file: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let head = reader
        .fill_buf()
        .with_context(|| format!("Failed to read sequence file: {}", path.display()))?;
    if head.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// First non-whitespace byte of the stream, if any
fn first_symbol(reader: &mut dyn BufRead) -> io::Result<Option<u8>> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        if let Some(&b) = buf.iter().find(|b| !b.is_ascii_whitespace()) {
            return Ok(Some(b));
        }
        let n = buf.len();
        reader.consume(n);
    }
}

/// Inspect the head of `path` to pick a reader
pub fn detect_format<P: AsRef<Path>>(path: P) -> Result<SequenceFormat> {
    let path = path.as_ref();
    let mut reader = open_reader(path)?;
    let symbol = first_symbol(&mut reader)
        .with_context(|| format!("Failed to read sequence file: {}", path.display()))?;
    Ok(match symbol {
        Some(b'>') | Some(b'@') => SequenceFormat::Fastx,
        Some(_) => SequenceFormat::PlainText,
        None => SequenceFormat::Empty,
    })
}

/// Parse a sequence file and call a function for each record
///
/// # Arguments
/// * `path` - Path to input file (FASTA/FASTQ or plain text, may be gzipped)
/// * `callback` - Function called for each sequence, receives (id, sequence)
///
/// Plain-text records are named `line<N>` after their 1-based line number.
///
/// # Errors
/// Returns error if the file cannot be opened or a FASTA/FASTQ record is
/// malformed, or if the callback fails.
pub fn parse_sequences<P, F>(path: P, mut callback: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnMut(&[u8], &[u8]) -> Result<()>,
{
    let path = path.as_ref();

    match detect_format(path)? {
        SequenceFormat::Empty => {
            tracing::warn!("Sequence file {} is empty", path.display());
        }
        SequenceFormat::Fastx => {
            // needletail automatically handles gzip decompression
            let mut reader = parse_fastx_file(path)
                .with_context(|| format!("Failed to open sequence file: {}", path.display()))?;

            while let Some(record) = reader.next() {
                let record = record.with_context(|| {
                    format!("Failed to parse sequence record in {}", path.display())
                })?;
                // Multi-line FASTA records come back joined
                let seq = record.seq();
                callback(record.id(), &seq)?;
            }
        }
        SequenceFormat::PlainText => {
            let reader = open_reader(path)?;
            for (i, line) in reader.split(b'\n').enumerate() {
                let line = line
                    .with_context(|| format!("Failed to read line {} of {}", i + 1, path.display()))?;
                let seq = trim_whitespace(&line);
                if seq.is_empty() {
                    continue;
                }
                let id = format!("line{}", i + 1);
                callback(id.as_bytes(), seq)?;
            }
        }
    }

    Ok(())
}

fn trim_whitespace(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

/// Count valid k-mer windows over every record of a file
///
/// Windows never span records, so this is the number of insertions a build
/// with the same `k` performs.
pub fn count_kmers<P: AsRef<Path>>(path: P, k: usize) -> Result<u64> {
    let mut total = 0u64;
    parse_sequences(path, |_id, seq| {
        total += count_sequence_kmers(seq, k)?;
        Ok(())
    })?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> Result<NamedTempFile> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(contents.as_bytes())?;
        temp_file.flush()?;
        Ok(temp_file)
    }

    fn collect(path: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut sequences = Vec::new();
        parse_sequences(path, |id, seq| {
            sequences.push((id.to_vec(), seq.to_vec()));
            Ok(())
        })?;
        Ok(sequences)
    }

    #[test]
    fn test_parse_fasta_file() -> Result<()> {
        let temp_file = write_temp(">seq1\nACGT\n>seq2 description\nTGCA\nNNac\n")?;

        let sequences = collect(temp_file.path())?;
        assert_eq!(sequences.len(), 2);
        assert_eq!(sequences[0].0, b"seq1");
        assert_eq!(sequences[0].1, b"ACGT");
        assert_eq!(sequences[1].0, b"seq2 description");
        // Lines of one record are joined, ambiguity codes kept
        assert_eq!(sequences[1].1, b"TGCANNac");

        Ok(())
    }

    #[test]
    fn test_parse_fastq_file() -> Result<()> {
        let temp_file = write_temp("@read1\nACGTACGT\n+\nIIIIIIII\n")?;
        let sequences = collect(temp_file.path())?;
        assert_eq!(sequences, vec![(b"read1".to_vec(), b"ACGTACGT".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_parse_plain_text_file() -> Result<()> {
        let temp_file = write_temp("ACGTACGT\n\n  ttgca \nGGCC\r\n")?;
        assert_eq!(detect_format(temp_file.path())?, SequenceFormat::PlainText);

        let sequences = collect(temp_file.path())?;
        assert_eq!(sequences.len(), 3);
        assert_eq!(sequences[0], (b"line1".to_vec(), b"ACGTACGT".to_vec()));
        assert_eq!(sequences[1], (b"line3".to_vec(), b"ttgca".to_vec()));
        assert_eq!(sequences[2], (b"line4".to_vec(), b"GGCC".to_vec()));
        Ok(())
    }

    fn write_gzip_temp(contents: &str) -> Result<NamedTempFile> {
        let mut temp_file = NamedTempFile::new()?;
        let mut encoder = GzEncoder::new(temp_file.as_file_mut(), Compression::default());
        encoder.write_all(contents.as_bytes())?;
        encoder.finish()?;
        Ok(temp_file)
    }

    #[test]
    fn test_parse_gzipped_plain_text_file() -> Result<()> {
        let temp_file = write_gzip_temp("\n\nACGTACGT\nttgca\n")?;
        assert_eq!(detect_format(temp_file.path())?, SequenceFormat::PlainText);

        let sequences = collect(temp_file.path())?;
        assert_eq!(
            sequences,
            vec![
                (b"line3".to_vec(), b"ACGTACGT".to_vec()),
                (b"line4".to_vec(), b"ttgca".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_parse_gzipped_fasta_file() -> Result<()> {
        let temp_file = write_gzip_temp(">chr1\nACGT\nAC\n")?;
        assert_eq!(detect_format(temp_file.path())?, SequenceFormat::Fastx);
        assert_eq!(collect(temp_file.path())?, vec![(b"chr1".to_vec(), b"ACGTAC".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_empty_gzip_file_has_no_records() -> Result<()> {
        let temp_file = write_gzip_temp("  \n")?;
        assert_eq!(detect_format(temp_file.path())?, SequenceFormat::Empty);
        assert!(collect(temp_file.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_empty_file_has_no_records() -> Result<()> {
        let temp_file = write_temp("\n  \n")?;
        assert_eq!(detect_format(temp_file.path())?, SequenceFormat::Empty);
        assert!(collect(temp_file.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(parse_sequences("/nonexistent/genome.fa", |_, _| Ok(())).is_err());
    }

    #[test]
    fn test_callback_error_propagates() -> Result<()> {
        let temp_file = write_temp(">a\nACGT\n>b\nACGT\n")?;
        let mut seen = 0;
        let result = parse_sequences(temp_file.path(), |_, _| {
            seen += 1;
            anyhow::bail!("stop")
        });
        assert!(result.is_err());
        assert_eq!(seen, 1);
        Ok(())
    }

    #[test]
    fn test_count_kmers_does_not_span_records() -> Result<()> {
        // Each record alone has 1 + 5 windows of length 4; joined there would be more
        let temp_file = write_temp(">a\nACGT\n>b\nTGCATGCA\n")?;
        assert_eq!(count_kmers(temp_file.path(), 4)?, 6);
        assert_eq!(count_kmers(temp_file.path(), 5)?, 4);
        Ok(())
    }
}
