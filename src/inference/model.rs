//! GGUF preflight
//!
//! Cheap header check run before handing a path to the engine, so a wrong
//! or truncated file is reported with a useful reason instead of an opaque
//! engine failure.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("cannot open file: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a GGUF file (magic 0x{0:08X})")]
    InvalidMagic(u32),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("file too small to be GGUF")]
    Truncated,
}

/// Fixed-size GGUF header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, GgufError> {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let quad = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let magic = word(0);
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidMagic(magic));
        }
        let version = word(4);
        if !(2..=3).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            tensor_count: quad(8),
            metadata_kv_count: quad(16),
        })
    }
}

/// Reads and validates the header of a GGUF model or projector file.
pub fn read_gguf_header<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut file = File::open(path)?;
    let mut bytes = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = file.read(&mut bytes[filled..])?;
        if n == 0 {
            return Err(GgufError::Truncated);
        }
        filled += n;
    }
    GgufHeader::parse(&bytes)
}
