//! Serialization and deserialization of Bloom filters
//!
//! # File Format
//!
//! A single file, all integers little-endian:
//!
//! ```text
//! FilterHeader
//!   ├─ magic: "KBLOOM01"
//!   ├─ version_major: u32
//!   ├─ version_minor: u32
//!   ├─ k: u32
//!   ├─ num_bits (m): u64
//!   ├─ num_hashes (h): u32
//!   ├─ seeds: [u64; h]
//!   └─ num_inserted: u64
//! Body:
//!   └─ bit array, ceil(m / 8) bytes, MSB-first within each byte
//! ```
//!
//! Every header field is validated before the body is read. The body must
//! be exactly `ceil(m / 8)` bytes: a short body and trailing bytes are both
//! rejected, as are set padding bits past `m`.
//!
//! [`save`] writes to a sibling temporary file and renames it into place
//! once the data is flushed, so an interrupted write never leaves a file
//! that looks complete.

use crate::bloom::{BloomFilter, FilterParams};
use crate::constants::{bytes_for_bits, is_valid_k, FORMAT_VERSION, MAGIC, MAX_HASHES};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bytes moved per write call for the body
const BODY_BLOCK_SIZE: usize = 1 << 20;

/// Serialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    /// I/O error during serialization
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The file is not a well-formed filter
    #[error("Invalid filter file: {0}")]
    Format(String),
}

/// Result type for serialization operations
pub type SerializationResult<T> = Result<T, SerializationError>;

fn format_error(msg: impl Into<String>) -> SerializationError {
    SerializationError::Format(msg.into())
}

/// Read exactly `N` bytes, reporting a short read as a truncated `field`
fn read_array<const N: usize>(reader: &mut dyn Read, field: &str) -> SerializationResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => format_error(format!("truncated header while reading {field}")),
        _ => SerializationError::Io(e),
    })?;
    Ok(buf)
}

fn read_u32(reader: &mut dyn Read, field: &str) -> SerializationResult<u32> {
    Ok(u32::from_le_bytes(read_array(reader, field)?))
}

fn read_u64(reader: &mut dyn Read, field: &str) -> SerializationResult<u64> {
    Ok(u64::from_le_bytes(read_array(reader, field)?))
}

/// Header for a serialized filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterHeader {
    /// Format version major number
    pub version_major: u32,
    /// Format version minor number
    pub version_minor: u32,
    /// K-mer length
    pub k: u32,
    /// Bit array size (`m`)
    pub num_bits: u64,
    /// One seed per hash function; `h` is their count
    pub seeds: Vec<u64>,
    /// Number of insertions recorded at build time
    pub num_inserted: u64,
}

impl FilterHeader {
    /// Header describing `filter`
    pub fn from_filter(filter: &BloomFilter) -> Self {
        Self {
            version_major: FORMAT_VERSION.0,
            version_minor: FORMAT_VERSION.1,
            k: filter.k() as u32,
            num_bits: filter.num_bits(),
            seeds: filter.seeds().to_vec(),
            num_inserted: filter.num_inserted(),
        }
    }

    /// Number of hash functions (`h`)
    pub fn num_hashes(&self) -> usize {
        self.seeds.len()
    }

    /// Size of the body that follows the header
    pub fn body_len(&self) -> u64 {
        bytes_for_bits(self.num_bits)
    }

    /// Size of the encoded header
    pub fn encoded_len(&self) -> u64 {
        (MAGIC.len() + 4 + 4 + 4 + 8 + 4 + 8 * self.seeds.len() + 8) as u64
    }

    /// Filter parameters recorded in the header
    pub fn params(&self) -> SerializationResult<FilterParams> {
        FilterParams::with_seeds(self.k as usize, self.num_bits, self.seeds.clone())
            .map_err(|e| format_error(e.to_string()))
    }

    /// Write header to a writer
    pub fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&self.version_major.to_le_bytes())?;
        writer.write_all(&self.version_minor.to_le_bytes())?;
        writer.write_all(&self.k.to_le_bytes())?;
        writer.write_all(&self.num_bits.to_le_bytes())?;
        writer.write_all(&(self.seeds.len() as u32).to_le_bytes())?;
        for seed in &self.seeds {
            writer.write_all(&seed.to_le_bytes())?;
        }
        writer.write_all(&self.num_inserted.to_le_bytes())?;
        Ok(())
    }

    /// Read and validate a header from a reader
    ///
    /// Fields are checked as soon as they are read, so a corrupt `h` is
    /// rejected before any seed is allocated.
    pub fn read(reader: &mut dyn Read) -> SerializationResult<Self> {
        let magic: [u8; 8] = read_array(reader, "magic")?;
        if &magic != MAGIC {
            return Err(format_error(format!(
                "bad magic {:?}, expected {:?}",
                String::from_utf8_lossy(&magic),
                String::from_utf8_lossy(MAGIC)
            )));
        }

        let version_major = read_u32(reader, "version")?;
        let version_minor = read_u32(reader, "version")?;
        if version_major != FORMAT_VERSION.0 {
            return Err(format_error(format!(
                "incompatible format version: {}.{}, expected {}.{}",
                version_major, version_minor, FORMAT_VERSION.0, FORMAT_VERSION.1
            )));
        }

        let k = read_u32(reader, "k")?;
        if !is_valid_k(k as usize) {
            return Err(format_error(format!("k must be in [1, 32], got {k}")));
        }

        let num_bits = read_u64(reader, "num_bits")?;
        if num_bits == 0 {
            return Err(format_error("bit array size is zero"));
        }

        let num_hashes = read_u32(reader, "num_hashes")?;
        if num_hashes == 0 || num_hashes > MAX_HASHES {
            return Err(format_error(format!(
                "number of hash functions must be in [1, {MAX_HASHES}], got {num_hashes}"
            )));
        }

        let seeds = (0..num_hashes)
            .map(|i| read_u64(reader, &format!("seed {i} of {num_hashes}")))
            .collect::<SerializationResult<Vec<u64>>>()?;

        let num_inserted = read_u64(reader, "num_inserted")?;

        Ok(Self {
            version_major,
            version_minor,
            k,
            num_bits,
            seeds,
            num_inserted,
        })
    }
}

/// Write a filter (header and body) to a writer
pub fn write_filter(filter: &BloomFilter, writer: &mut dyn Write) -> io::Result<()> {
    FilterHeader::from_filter(filter).write(writer)?;
    for block in filter.as_bytes().chunks(BODY_BLOCK_SIZE) {
        writer.write_all(block)?;
    }
    Ok(())
}

/// Read a filter from a reader that must end right after the body
pub fn read_filter(reader: &mut dyn Read) -> SerializationResult<BloomFilter> {
    let header = FilterHeader::read(reader)?;
    let params = header.params()?;
    let expected = header.body_len();

    // take() bounds the read; read_to_end grows the buffer as data arrives
    let mut bits = Vec::new();
    Read::take(&mut *reader, expected).read_to_end(&mut bits)?;
    if (bits.len() as u64) < expected {
        return Err(format_error(format!(
            "truncated body: expected {expected} bytes, got {}",
            bits.len()
        )));
    }

    let mut probe = [0u8; 1];
    if reader.read(&mut probe)? != 0 {
        return Err(format_error(format!(
            "trailing bytes after the {expected}-byte body"
        )));
    }

    BloomFilter::from_parts(params, header.num_inserted, bits).map_err(|e| format_error(e.to_string()))
}

/// Sibling temporary path used while writing `path`
fn temp_path(path: &Path) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a file path: {}", path.display()),
        )
    })?;
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(name);
    temp_name.push(format!(".tmp-{}", std::process::id()));
    Ok(path.with_file_name(temp_name))
}

/// Write `path` through a sibling temporary file
///
/// `write` fills the temporary file, which is synced and renamed over
/// `path` only if every step succeeds. On failure it is removed and `path`
/// is left untouched.
pub fn write_atomically<P, F, E>(path: P, write: F) -> Result<(), E>
where
    P: AsRef<Path>,
    F: FnOnce(&mut BufWriter<File>) -> Result<(), E>,
    E: From<io::Error>,
{
    let path = path.as_ref();
    let tmp = temp_path(path)?;

    let written = (|| -> Result<(), E> {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        write(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

/// Persist a filter to `path`
///
/// The data goes to a temporary file in the same directory, which is
/// renamed over `path` only after it has been flushed and synced.
pub fn save<P: AsRef<Path>>(filter: &BloomFilter, path: P) -> SerializationResult<()> {
    let path = path.as_ref();
    write_atomically(path, |writer| write_filter(filter, writer)).map_err(|e: io::Error| {
        SerializationError::Io(io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))
    })?;

    tracing::debug!(
        "Wrote {} ({} header bytes + {} body bytes)",
        path.display(),
        FilterHeader::from_filter(filter).encoded_len(),
        filter.as_bytes().len()
    );
    Ok(())
}

/// Load a filter from `path`
pub fn load<P: AsRef<Path>>(path: P) -> SerializationResult<BloomFilter> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        SerializationError::Io(io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))
    })?;
    let mut reader = BufReader::new(file);
    let filter = read_filter(&mut reader)?;
    tracing::debug!(
        "Loaded {} (k={}, m={}, h={})",
        path.display(),
        filter.k(),
        filter.num_bits(),
        filter.num_hashes()
    );
    Ok(filter)
}
