//! Durable record storage on a small flat filesystem.
//!
//! A store keeps fixed-size, CRC protected records in chunk files under one
//! directory. Each chunk file holds at most one telemetry request worth of
//! records so a failed upload only ever affects a single file.
//!
//! Record layout (little-endian):
//! - timestamp: 4 bytes (u32, seconds since epoch)
//! - crc32: 4 bytes (u32, computed over the whole record with this field zeroed)
//! - payload: `Record::PAYLOAD_SIZE` bytes, encoded by the record type

pub mod mem;
pub mod reader;
pub mod store;

pub use mem::MemFileSystem;
pub use reader::DataStoreReader;
pub use store::DataStore;

use alloc::vec;
use alloc::vec::Vec;
use thiserror_no_std::Error;

use crate::crc::crc32_with_zeroed_field;
use crate::error::ErrorDetail;

/// Bytes preceding the payload of every record.
pub const RECORD_HEADER_SIZE: usize = 8;
const CRC_OFFSET: usize = 4;

/// Maximum length of a chunk file path.
pub const PATH_MAX: usize = 32;

/// Path of a file on the device filesystem.
pub type Path = heapless::String<PATH_MAX>;

/// A fixed-size record that can be persisted in a [`DataStore`].
pub trait Record: Sized + Clone {
    /// Encoded payload size in bytes, excluding the record header.
    const PAYLOAD_SIZE: usize;

    /// Encoded size of the whole record.
    const SIZE: usize = RECORD_HEADER_SIZE + Self::PAYLOAD_SIZE;

    fn timestamp(&self) -> u32;

    /// Writes the payload into `out`, which is exactly `PAYLOAD_SIZE` long.
    fn encode_payload(&self, out: &mut [u8]);

    /// Rebuilds a record from its timestamp and `PAYLOAD_SIZE` payload bytes.
    fn decode_payload(timestamp: u32, payload: &[u8]) -> Self;
}

/// Encodes a record with its CRC32 filled in.
pub fn encode_record<R: Record>(record: &R) -> Vec<u8> {
    let mut bytes = vec![0u8; R::SIZE];
    bytes[0..4].copy_from_slice(&record.timestamp().to_le_bytes());
    record.encode_payload(&mut bytes[RECORD_HEADER_SIZE..]);

    let crc = crc32_with_zeroed_field(&bytes, CRC_OFFSET);
    bytes[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    bytes
}

/// Decodes a record and reports whether its stored CRC32 matches.
///
/// Returns `None` when `bytes` is not exactly one record long.
pub fn decode_record<R: Record>(bytes: &[u8]) -> Option<(R, bool)> {
    if bytes.len() != R::SIZE {
        return None;
    }

    let timestamp = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let stored_crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let crc_valid = crc32_with_zeroed_field(bytes, CRC_OFFSET) == stored_crc;

    Some((
        R::decode_payload(timestamp, &bytes[RECORD_HEADER_SIZE..]),
        crc_valid,
    ))
}

/// Little-endian cursor used by record types to write their payload.
pub struct PayloadWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> PayloadWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        let end = self.offset + bytes.len();
        if let Some(dst) = self.buf.get_mut(self.offset..end) {
            dst.copy_from_slice(bytes);
        }
        self.offset = end;
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put(&value.to_le_bytes());
    }

    pub fn put_f32(&mut self, value: f32) {
        self.put(&value.to_le_bytes());
    }
}

/// Little-endian cursor used by record types to read their payload.
///
/// Reads past the end of the buffer yield zero.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.buf.get(self.offset..self.offset + N) {
            out.copy_from_slice(src);
        }
        self.offset += N;
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    pub fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    pub fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }
}

/// Directory entry returned by [`FileSystem::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path, including the directory
    pub path: Path,
    pub size: u64,
}

/// Space usage of the filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FsError {
    #[error("File not found")]
    NotFound,
    #[error("No space left on device")]
    NoSpace,
    #[error("Path too long")]
    PathTooLong,
    #[error("I/O error: {0}")]
    Io(ErrorDetail),
}

/// Flat filesystem the record stores live on.
///
/// Files are created on the first append. Paths are `"{dir}/{name}"`.
pub trait FileSystem {
    /// Lists the files directly under `dir`, sorted by path.
    fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, FsError>;

    /// Size of the file at `path`, or `None` if it does not exist.
    fn file_size(&mut self, path: &str) -> Result<Option<u64>, FsError>;

    /// Appends `data`, creating the file if needed. Returns bytes written.
    fn append(&mut self, path: &str, data: &[u8]) -> Result<usize, FsError>;

    /// Reads up to `buf.len()` bytes at `offset`. Returns bytes read.
    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;

    fn remove(&mut self, path: &str) -> Result<(), FsError>;

    fn usage(&mut self) -> Result<FsUsage, FsError>;
}

/// Copies `s` into a [`Path`].
pub fn path_from(s: &str) -> Result<Path, FsError> {
    let mut path = Path::new();
    path.push_str(s).map_err(|_| FsError::PathTooLong)?;
    Ok(path)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
    #[error("No free chunk file name")]
    NoFreeFileName,
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
}
