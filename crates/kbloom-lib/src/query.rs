//! Sample scoring against a built filter
//!
//! A sample is scored by running the canonicalizer with the filter's `k`
//! and testing every valid window. The similarity score is the fraction of
//! windows that test positive. A sample with no valid window has no score:
//! it is reported as [`Score::Undefined`], never as 0 or 1.
//!
//! The filter is only read, so one [`QueryEngine`] can score many samples
//! concurrently.

use crate::bloom::BloomFilter;
use crate::builder::parse::parse_sequences;
use crate::kmer::{decode_kmer, CanonicalKmers};
use anyhow::Result;
use rayon::prelude::*;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

/// Bases buffered before a round of parallel scoring
const QUERY_BATCH_BASES: usize = 1 << 24;

/// A similarity score in `[0, 1]`, or the absence of one
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Score {
    /// The sample had no valid k-mer
    Undefined,
    /// Fraction of sample k-mers present in the filter
    Value(f64),
}

impl Score {
    /// The numeric score, if defined
    pub fn value(self) -> Option<f64> {
        match self {
            Score::Undefined => None,
            Score::Value(v) => Some(v),
        }
    }

    /// Whether a numeric score exists
    pub fn is_defined(self) -> bool {
        matches!(self, Score::Value(_))
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Undefined => write!(f, "NA"),
            Score::Value(v) => write!(f, "{:.6}", v),
        }
    }
}

/// Per-sample counts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Valid k-mers examined
    pub total_kmers: u64,
    /// K-mers that tested positive
    pub positive_kmers: u64,
}

impl QueryResult {
    /// `positive / total`, undefined when no k-mer was examined
    pub fn score(&self) -> Score {
        if self.total_kmers == 0 {
            Score::Undefined
        } else {
            Score::Value(self.positive_kmers as f64 / self.total_kmers as f64)
        }
    }

    /// Score corrected for a filter false-positive rate `fp_rate`:
    /// `clamp((score - fpr) / (1 - fpr), 0, 1)`
    pub fn adjusted_score(&self, fp_rate: f64) -> Score {
        match self.score() {
            Score::Undefined => Score::Undefined,
            Score::Value(_) if fp_rate >= 1.0 => Score::Undefined,
            Score::Value(s) => {
                let fp_rate = fp_rate.max(0.0);
                Score::Value(((s - fp_rate) / (1.0 - fp_rate)).clamp(0.0, 1.0))
            }
        }
    }
}

/// Membership of one window of a sample
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KmerDetail {
    /// 0-based start of the window in the sample
    pub position: usize,
    /// Canonical k-mer
    pub kmer: String,
    /// Whether the filter reports it present
    pub hit: bool,
}

/// Scored sample
#[derive(Clone, Debug, PartialEq)]
pub struct SampleReport {
    /// Record identifier
    pub sample_id: String,
    /// File the record came from
    pub source: String,
    /// Counts
    pub result: QueryResult,
    /// Raw score
    pub score: Score,
    /// False-positive-corrected score
    pub adjusted_score: Score,
    /// Per-window detail, empty unless requested
    pub details: Vec<KmerDetail>,
}

/// Query engine over a read-only filter
pub struct QueryEngine<'a> {
    filter: &'a BloomFilter,
    fp_rate: f64,
}

impl<'a> QueryEngine<'a> {
    /// Create an engine; the false-positive rate used for score correction
    /// is estimated once from the filter's fill
    pub fn new(filter: &'a BloomFilter) -> Self {
        Self {
            filter,
            fp_rate: filter.estimated_fp_rate(),
        }
    }

    /// The filter being queried
    pub fn filter(&self) -> &BloomFilter {
        self.filter
    }

    /// Estimated false-positive rate of the filter
    pub fn fp_rate(&self) -> f64 {
        self.fp_rate
    }

    /// Count positive windows of `seq`
    pub fn query_sequence(&self, seq: &[u8]) -> QueryResult {
        let mut result = QueryResult::default();
        // k was validated when the filter was created
        if let Ok(kmers) = CanonicalKmers::new(seq, self.filter.k()) {
            for hit in kmers {
                result.total_kmers += 1;
                if self.filter.contains(hit.code) {
                    result.positive_kmers += 1;
                }
            }
        }
        result
    }

    /// Membership of every valid window of `seq`
    pub fn detail(&self, seq: &[u8]) -> Vec<KmerDetail> {
        let k = self.filter.k();
        match CanonicalKmers::new(seq, k) {
            Ok(kmers) => kmers
                .map(|hit| KmerDetail {
                    position: hit.position,
                    kmer: decode_kmer(hit.code, k),
                    hit: self.filter.contains(hit.code),
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Score one named sample
    pub fn report(&self, sample_id: &str, source: &str, seq: &[u8], with_detail: bool) -> SampleReport {
        let result = self.query_sequence(seq);
        SampleReport {
            sample_id: sample_id.to_string(),
            source: source.to_string(),
            result,
            score: result.score(),
            adjusted_score: result.adjusted_score(self.fp_rate),
            details: if with_detail { self.detail(seq) } else { Vec::new() },
        }
    }

    /// Score every record of a sequence file, in file order
    ///
    /// Records are buffered in bounded batches and each batch is scored in
    /// parallel on the current rayon pool. Reports are handed to `sink` as
    /// soon as their batch is scored. Returns the number of samples scored.
    pub fn query_file_with<P, F>(&self, path: P, with_detail: bool, mut sink: F) -> Result<usize>
    where
        P: AsRef<Path>,
        F: FnMut(SampleReport) -> Result<()>,
    {
        let path = path.as_ref();
        let source = path.display().to_string();
        let mut tally = Tally::default();
        let mut batch: Vec<(String, Vec<u8>)> = Vec::new();
        let mut batch_bases = 0usize;

        parse_sequences(path, |id, seq| {
            batch.push((String::from_utf8_lossy(id).into_owned(), seq.to_vec()));
            batch_bases += seq.len();
            if batch_bases >= QUERY_BATCH_BASES {
                self.emit_batch(&batch, &source, with_detail, &mut sink, &mut tally)?;
                batch.clear();
                batch_bases = 0;
            }
            Ok(())
        })?;
        self.emit_batch(&batch, &source, with_detail, &mut sink, &mut tally)?;

        tracing::info!("Scored {} samples from {}", tally.samples, source);
        if tally.undefined > 0 {
            tracing::warn!(
                "{} samples in {} have no valid {}-mer and no score",
                tally.undefined,
                source,
                self.filter.k()
            );
        }
        Ok(tally.samples)
    }

    /// Score every record of a sequence file and collect the reports
    pub fn query_file<P: AsRef<Path>>(&self, path: P, with_detail: bool) -> Result<Vec<SampleReport>> {
        let mut reports = Vec::new();
        self.query_file_with(path, with_detail, |report| {
            reports.push(report);
            Ok(())
        })?;
        Ok(reports)
    }

    fn emit_batch<F>(
        &self,
        batch: &[(String, Vec<u8>)],
        source: &str,
        with_detail: bool,
        sink: &mut F,
        tally: &mut Tally,
    ) -> Result<()>
    where
        F: FnMut(SampleReport) -> Result<()>,
    {
        let reports: Vec<SampleReport> = batch
            .par_iter()
            .map(|(id, seq)| self.report(id, source, seq, with_detail))
            .collect();
        for report in reports {
            tally.samples += 1;
            if !report.score.is_defined() {
                tally.undefined += 1;
            }
            sink(report)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Tally {
    samples: usize,
    undefined: usize,
}

/// Column header of the summary table
pub const SUMMARY_HEADER: &str = "sample_id\tsource\ttotal_kmers\tpositive_kmers\tscore\tadjusted_score";

/// Column header of the per-k-mer table
pub const DETAIL_HEADER: &str = "sample_id\tposition\tkmer\thit";

fn write_summary_row(writer: &mut dyn Write, r: &SampleReport) -> io::Result<()> {
    writeln!(
        writer,
        "{}\t{}\t{}\t{}\t{}\t{}",
        r.sample_id, r.source, r.result.total_kmers, r.result.positive_kmers, r.score, r.adjusted_score
    )
}

fn write_detail_rows(writer: &mut dyn Write, r: &SampleReport) -> io::Result<()> {
    for d in &r.details {
        writeln!(writer, "{}\t{}\t{}\t{}", r.sample_id, d.position, d.kmer, d.hit as u8)?;
    }
    Ok(())
}

/// Write reports as TSV: the summary table, then (if requested) a blank
/// line and the per-k-mer table
pub fn write_tsv(reports: &[SampleReport], writer: &mut dyn Write, with_detail: bool) -> io::Result<()> {
    writeln!(writer, "{}", SUMMARY_HEADER)?;
    for r in reports {
        write_summary_row(writer, r)?;
    }

    if with_detail {
        writeln!(writer)?;
        writeln!(writer, "{}", DETAIL_HEADER)?;
        for r in reports {
            write_detail_rows(writer, r)?;
        }
    }
    Ok(())
}

/// Streaming form of [`write_tsv`]
///
/// Summary rows go straight to the output. Detail rows are spooled to a
/// scratch file and appended after the summary table by
/// [`TsvWriter::finish`], so neither table is held in memory.
pub struct TsvWriter<W: Write> {
    out: W,
    detail: Option<BufWriter<File>>,
}

impl<W: Write> TsvWriter<W> {
    /// Start a table on `out`. `detail_spool`, if given, must be an empty
    /// file opened for both reading and writing.
    pub fn new(mut out: W, detail_spool: Option<File>) -> io::Result<Self> {
        writeln!(out, "{}", SUMMARY_HEADER)?;
        Ok(Self {
            out,
            detail: detail_spool.map(BufWriter::new),
        })
    }

    /// Append one sample
    pub fn write_report(&mut self, report: &SampleReport) -> io::Result<()> {
        write_summary_row(&mut self.out, report)?;
        if let Some(detail) = self.detail.as_mut() {
            write_detail_rows(detail, report)?;
        }
        Ok(())
    }

    /// Append the spooled detail table and flush; returns the output
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(detail) = self.detail.take() {
            let mut spool = detail.into_inner().map_err(|e| e.into_error())?;
            spool.seek(SeekFrom::Start(0))?;
            writeln!(self.out)?;
            writeln!(self.out, "{}", DETAIL_HEADER)?;
            io::copy(&mut spool, &mut self.out)?;
        }
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::FilterParams;

    const GENOME: &[u8] = b"ACGTACGTACGT";

    fn genome_filter() -> BloomFilter {
        let params = FilterParams::with_seeds(4, 64, vec![0x1234, 0x5678, 0x9abc]).unwrap();
        let mut filter = BloomFilter::new(&params).unwrap();
        filter.insert_sequence(GENOME);
        filter
    }

    #[test]
    fn test_same_genome_scores_one() {
        let filter = genome_filter();
        let engine = QueryEngine::new(&filter);
        let result = engine.query_sequence(GENOME);
        assert_eq!(result, QueryResult { total_kmers: 9, positive_kmers: 9 });
        assert_eq!(result.score(), Score::Value(1.0));
    }

    #[test]
    fn test_unrelated_sample_scores_low() {
        let filter = genome_filter();
        let engine = QueryEngine::new(&filter);
        // None of its windows is ACGT, CGTA, TACG or GTAC
        let result = engine.query_sequence(b"AAACCCTTTGGGAATTCCGGATCATGGCCAAGGTTAACCT");
        assert!(result.total_kmers > 30);
        let score = result.score().value().unwrap();
        assert!(score < 0.25, "score = {score}");
    }

    #[test]
    fn test_short_or_invalid_sample_is_undefined() {
        let filter = genome_filter();
        let engine = QueryEngine::new(&filter);
        for sample in [&b"ACG"[..], &b""[..], &b"NNNNNNNN"[..], &b"ACNGTNAC"[..]] {
            let result = engine.query_sequence(sample);
            assert_eq!(result.total_kmers, 0);
            assert_eq!(result.score(), Score::Undefined);
            assert_eq!(result.adjusted_score(0.01), Score::Undefined);
        }
    }

    #[test]
    fn test_reverse_complement_sample_matches() {
        let params = FilterParams::new(5, 4096, 4, 1).unwrap();
        let mut filter = BloomFilter::new(&params).unwrap();
        filter.insert_sequence(b"GATTACAGGATTACCAGT");
        let engine = QueryEngine::new(&filter);
        let result = engine.query_sequence(b"ACTGGTAATCCTGTAATC");
        assert_eq!(result.score(), Score::Value(1.0));
    }

    #[test]
    fn test_adjusted_score() {
        let result = QueryResult { total_kmers: 10, positive_kmers: 5 };
        let adjusted = result.adjusted_score(0.1).value().unwrap();
        assert!((adjusted - 0.4 / 0.9).abs() < 1e-12);

        // Below the false-positive floor clamps to zero
        let result = QueryResult { total_kmers: 100, positive_kmers: 1 };
        assert_eq!(result.adjusted_score(0.05), Score::Value(0.0));

        let result = QueryResult { total_kmers: 4, positive_kmers: 4 };
        assert_eq!(result.adjusted_score(0.0), Score::Value(1.0));
        assert_eq!(result.adjusted_score(0.3), Score::Value(1.0));
    }

    #[test]
    fn test_detail_positions() {
        let filter = genome_filter();
        let engine = QueryEngine::new(&filter);
        let details = engine.detail(b"ACGTNACGTA");
        let positions: Vec<usize> = details.iter().map(|d| d.position).collect();
        assert_eq!(positions, vec![0, 5, 6]);
        assert_eq!(details[0].kmer, "ACGT");
        // CGTA is canonical for TACG and itself
        assert_eq!(details[2].kmer, "CGTA");
        assert!(details.iter().all(|d| d.hit));
    }

    #[test]
    fn test_score_display() {
        assert_eq!(Score::Undefined.to_string(), "NA");
        assert_eq!(Score::Value(0.5).to_string(), "0.500000");
    }

    #[test]
    fn test_query_file_and_tsv() -> Result<()> {
        let mut fasta = tempfile::NamedTempFile::new()?;
        writeln!(fasta, ">same\nACGTACGTACGT\n>short\nACG")?;
        fasta.flush()?;

        let filter = genome_filter();
        let engine = QueryEngine::new(&filter);
        let reports = engine.query_file(fasta.path(), true)?;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].sample_id, "same");
        assert_eq!(reports[0].score, Score::Value(1.0));
        assert_eq!(reports[0].details.len(), 9);
        assert_eq!(reports[1].score, Score::Undefined);

        let mut out = Vec::new();
        write_tsv(&reports, &mut out, true)?;
        let text = String::from_utf8(out)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], SUMMARY_HEADER);
        assert!(lines[1].starts_with("same\t"));
        assert!(lines[1].contains("\t9\t9\t1.000000\t"));
        assert!(lines[2].starts_with("short\t"));
        assert!(lines[2].ends_with("\t0\t0\tNA\tNA"));
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], DETAIL_HEADER);
        assert_eq!(lines[5], "same\t0\tACGT\t1");
        assert_eq!(lines.len(), 5 + 9);
        Ok(())
    }

    #[test]
    fn test_streaming_tsv_matches_collected_tsv() -> Result<()> {
        let mut fasta = tempfile::NamedTempFile::new()?;
        writeln!(fasta, ">same\nACGTACGTACGT\n>mixed\nACGTTTTTACGT\n>short\nACG")?;
        fasta.flush()?;

        let filter = genome_filter();
        let engine = QueryEngine::new(&filter);

        let mut collected = Vec::new();
        write_tsv(&engine.query_file(fasta.path(), true)?, &mut collected, true)?;

        let mut tsv = TsvWriter::new(Vec::new(), Some(tempfile::tempfile()?))?;
        let scored = engine.query_file_with(fasta.path(), true, |report| {
            tsv.write_report(&report)?;
            Ok(())
        })?;
        assert_eq!(scored, 3);
        let streamed = tsv.finish()?;
        assert_eq!(String::from_utf8(streamed)?, String::from_utf8(collected)?);

        // Without a spool only the summary table is written
        let mut tsv = TsvWriter::new(Vec::new(), None)?;
        engine.query_file_with(fasta.path(), false, |report| Ok(tsv.write_report(&report)?))?;
        let summary = String::from_utf8(tsv.finish()?)?;
        assert_eq!(summary.lines().count(), 4);
        assert!(!summary.contains(DETAIL_HEADER));
        Ok(())
    }

    #[test]
    fn test_query_file_with_stops_on_sink_error() -> Result<()> {
        let mut fasta = tempfile::NamedTempFile::new()?;
        writeln!(fasta, ">a\nACGTACGT\n>b\nACGTACGT")?;
        fasta.flush()?;

        let filter = genome_filter();
        let engine = QueryEngine::new(&filter);
        let mut seen = 0;
        let result = engine.query_file_with(fasta.path(), false, |_| {
            seen += 1;
            anyhow::bail!("output closed")
        });
        assert!(result.is_err());
        assert_eq!(seen, 1);
        Ok(())
    }
}
