use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use kbloom_lib::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_FP_RATE, DEFAULT_K, DEFAULT_SEED};
use kbloom_lib::query::TsvWriter;
use kbloom_lib::serialization::{write_atomically, FilterHeader};
use kbloom_lib::{load, save, BuildConfiguration, FilterBuilder, QueryEngine, Sizing};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "kbloom")]
#[command(version = "0.1.0")]
#[command(about = "k-mer Bloom filters for genome membership scoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a filter from a genome
    Build(BuildArgs),

    /// Score query samples against a filter
    Query(QueryArgs),

    /// Verify that every k-mer of the genome is reported present
    Check {
        /// Filter file
        #[arg(short, long)]
        filter: PathBuf,

        /// Genome the filter was built from
        #[arg(short, long)]
        input: PathBuf,

        /// Number of threads (0 = all available cores)
        #[arg(short = 't', long, default_value_t = 0)]
        threads: usize,
    },

    /// Print the header and fill statistics of a filter
    Inspect {
        /// Filter file
        #[arg(short, long)]
        filter: PathBuf,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Input genome (FASTA/FASTQ, optionally gzipped, or one sequence per line)
    #[arg(short, long)]
    input: PathBuf,

    /// Output filter file (default: <input stem>.kbf)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// K-mer length (1..=32)
    #[arg(short, default_value_t = DEFAULT_K)]
    k: usize,

    /// Target false-positive rate
    #[arg(long, default_value_t = DEFAULT_FP_RATE, conflicts_with = "bits")]
    fp_rate: f64,

    /// Expected number of k-mers (default: counted from the input)
    #[arg(long, conflicts_with = "bits")]
    expected_kmers: Option<u64>,

    /// Bit array size, overriding rate-based sizing
    #[arg(long, requires = "hashes")]
    bits: Option<u64>,

    /// Number of hash functions, used with --bits
    #[arg(long, requires = "bits")]
    hashes: Option<usize>,

    /// Master seed for the hash functions
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// Number of threads (0 = all available cores)
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Bases per chunk handed to one worker
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

#[derive(Args)]
struct QueryArgs {
    /// Filter file
    #[arg(short, long)]
    filter: PathBuf,

    /// Query samples (FASTA/FASTQ or one sequence per line); every record is a sample
    #[arg(short, long, required = true, num_args = 1..)]
    query: Vec<PathBuf>,

    /// Also report every k-mer with its membership
    #[arg(long)]
    detail: bool,

    /// Output TSV file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of threads (0 = all available cores)
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing: use RUST_LOG if set, otherwise default to info.
    // Logs go to stderr so that stdout carries results only.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build(args) => build_command(&args),
        Commands::Query(args) => query_command(&args),
        Commands::Check { filter, input, threads } => {
            let missing = check_command(&filter, &input, threads)?;
            if missing > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Inspect { filter } => inspect_command(&filter, &mut io::stdout().lock()),
    }
}

/// Sizing policy from the build flags
fn sizing_from_args(args: &BuildArgs) -> anyhow::Result<Sizing> {
    match (args.bits, args.hashes) {
        (Some(num_bits), Some(num_hashes)) => Ok(Sizing::Explicit { num_bits, num_hashes }),
        (None, None) => Ok(Sizing::FalsePositiveRate {
            rate: args.fp_rate,
            expected_kmers: args.expected_kmers,
        }),
        _ => bail!("--bits and --hashes must be given together"),
    }
}

/// `<input stem>.kbf` in the current directory, ignoring a compression suffix
fn default_output_path(input: &Path) -> PathBuf {
    let mut stem = Path::new(input.file_name().unwrap_or(input.as_os_str()));
    if stem.extension().is_some_and(|ext| ext == "gz") {
        stem = Path::new(stem.file_stem().unwrap_or(stem.as_os_str()));
    }
    let stem = stem.file_stem().map(|s| s.to_string_lossy().into_owned());
    PathBuf::from(format!("{}.kbf", stem.as_deref().unwrap_or("filter")))
}

/// Build a filter from a genome and save it
fn build_command(args: &BuildArgs) -> anyhow::Result<()> {
    info!("Building kbloom filter...");
    info!("  Input: {}", args.input.display());

    let mut config = BuildConfiguration::new(args.k)?;
    config.sizing = sizing_from_args(args)?;
    config.seed = args.seed;
    config.num_threads = args.threads;
    config.chunk_size = args.chunk_size;

    let builder = FilterBuilder::new(config)?;
    let filter = builder
        .build_from_file(&args.input)
        .with_context(|| format!("Failed to build filter from {}", args.input.display()))?;

    let output_path = args.output.clone().unwrap_or_else(|| default_output_path(&args.input));
    info!("Saving filter to {}...", output_path.display());
    save(&filter, &output_path)?;

    info!("Filter built successfully!");
    Ok(())
}

fn thread_pool(threads: usize) -> anyhow::Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("Failed to create thread pool")
}

/// Scratch file holding detail rows until the summary table is complete
struct DetailSpool {
    path: PathBuf,
}

impl DetailSpool {
    /// Create the spool next to `output`, or in the temp directory
    fn create(output: Option<&Path>) -> anyhow::Result<(Self, File)> {
        let name = format!(".kbloom-detail-{}.tsv", std::process::id());
        let path = match output.and_then(Path::parent) {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(name),
            _ => std::env::temp_dir().join(name),
        };
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create detail spool: {}", path.display()))?;
        Ok((Self { path }, file))
    }
}

impl Drop for DetailSpool {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Score every record of every query file
fn query_command(args: &QueryArgs) -> anyhow::Result<()> {
    info!("Loading filter from {}...", args.filter.display());
    let filter = load(&args.filter)?;
    info!(
        "Filter loaded (k={}, m={}, h={})",
        filter.k(),
        filter.num_bits(),
        filter.num_hashes()
    );

    let engine = QueryEngine::new(&filter);
    info!("  Estimated false-positive rate: {:.6}", engine.fp_rate());
    let pool = thread_pool(args.threads)?;

    match &args.output {
        Some(path) => {
            let mut scored = 0;
            write_atomically(path, |writer| -> anyhow::Result<()> {
                scored = write_reports(&engine, &pool, args, writer, Some(path))?;
                Ok(())
            })
            .with_context(|| format!("Failed to write results to {}", path.display()))?;
            info!("Wrote {} results to {}", scored, path.display());
        }
        None => {
            let mut writer = BufWriter::new(io::stdout());
            write_reports(&engine, &pool, args, &mut writer, None)?;
        }
    }
    Ok(())
}

/// Stream the TSV of every query file to `out`; returns the number of samples
fn write_reports(
    engine: &QueryEngine,
    pool: &rayon::ThreadPool,
    args: &QueryArgs,
    out: &mut (dyn Write + Send),
    output: Option<&Path>,
) -> anyhow::Result<usize> {
    // Removed on return, after its rows were copied into `out`
    let (_spool, spool_file) = if args.detail {
        let (spool, file) = DetailSpool::create(output)?;
        (Some(spool), Some(file))
    } else {
        (None, None)
    };

    let mut tsv = TsvWriter::new(out, spool_file)?;
    let mut scored = 0;
    for path in &args.query {
        scored += pool
            .install(|| {
                engine.query_file_with(path, args.detail, |report| {
                    tsv.write_report(&report)?;
                    Ok(())
                })
            })
            .with_context(|| format!("Failed to query {}", path.display()))?;
    }
    tsv.finish()?;
    Ok(scored)
}

/// Re-query every genome k-mer; returns how many were reported absent
fn check_command(filter_path: &Path, input: &Path, threads: usize) -> anyhow::Result<u64> {
    info!("Checking filter correctness...");
    info!("  Filter: {}", filter_path.display());
    info!("  Input: {}", input.display());

    let filter = load(filter_path)?;
    let engine = QueryEngine::new(&filter);

    let mut total = 0u64;
    let mut missing = 0u64;
    let records = thread_pool(threads)?.install(|| {
        engine.query_file_with(input, false, |r| {
            total += r.result.total_kmers;
            let absent = r.result.total_kmers - r.result.positive_kmers;
            if absent > 0 {
                missing += absent;
                warn!("  {}: {} of {} k-mers missing", r.sample_id, absent, r.result.total_kmers);
            }
            Ok(())
        })
    })?;

    if missing == 0 {
        info!("Check passed: all {} k-mers of {} records found", total, records);
    } else {
        error!("Check failed: {} of {} k-mers missing", missing, total);
    }
    Ok(missing)
}

/// Print header fields and fill statistics
fn inspect_command(filter_path: &Path, out: &mut dyn Write) -> anyhow::Result<()> {
    let filter = load(filter_path)?;
    let header = FilterHeader::from_filter(&filter);
    let params = filter.params();

    writeln!(out, "file\t{}", filter_path.display())?;
    writeln!(out, "format_version\t{}.{}", header.version_major, header.version_minor)?;
    writeln!(out, "k\t{}", header.k)?;
    writeln!(out, "num_bits\t{}", header.num_bits)?;
    writeln!(out, "num_hashes\t{}", header.num_hashes())?;
    let seeds: Vec<String> = header.seeds.iter().map(|s| format!("{s:#018x}")).collect();
    writeln!(out, "seeds\t{}", seeds.join(","))?;
    writeln!(out, "num_inserted\t{}", header.num_inserted)?;
    writeln!(out, "file_bytes\t{}", header.encoded_len() + header.body_len())?;
    writeln!(out, "bits_set\t{}", filter.count_ones())?;
    writeln!(out, "fill_ratio\t{:.6}", filter.fill_ratio())?;
    writeln!(out, "estimated_fp_rate\t{:.6}", filter.estimated_fp_rate())?;
    writeln!(
        out,
        "theoretical_fp_rate\t{:.6}",
        params.theoretical_fp_rate(header.num_inserted)
    )?;
    Ok(())
}
