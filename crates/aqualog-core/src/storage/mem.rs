//! In-memory [`FileSystem`] used by tests and host tooling.
//!
//! Besides plain storage it can inject append failures and corrupt bytes, so
//! the store's failure handling can be exercised without hardware.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use super::{FileInfo, FileSystem, FsError, FsUsage, path_from};
use crate::error::detail;

#[derive(Clone)]
pub struct MemFileSystem {
    files: BTreeMap<String, Vec<u8>>,
    capacity_bytes: u64,
    failing_appends: usize,
    short_write: Option<usize>,
    append_calls: usize,
}

impl MemFileSystem {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            files: BTreeMap::new(),
            capacity_bytes,
            failing_appends: 0,
            short_write: None,
            append_calls: 0,
        }
    }

    /// Makes the next `count` appends fail without writing anything.
    pub fn fail_next_appends(&mut self, count: usize) {
        self.failing_appends = count;
    }

    /// Makes the next append write only `bytes` bytes.
    pub fn short_write_next(&mut self, bytes: usize) {
        self.short_write = Some(bytes);
    }

    /// Number of append calls seen, including failed ones.
    pub fn append_calls(&self) -> usize {
        self.append_calls
    }

    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Replaces a file's contents outright.
    pub fn put_raw(&mut self, path: &str, data: &[u8]) {
        self.files.insert(String::from(path), data.to_vec());
    }

    /// XORs one byte of a file. Returns false if the byte does not exist.
    pub fn corrupt(&mut self, path: &str, offset: usize, mask: u8) -> bool {
        match self.files.get_mut(path).and_then(|f| f.get_mut(offset)) {
            Some(byte) => {
                *byte ^= mask;
                true
            }
            None => false,
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn used(&self) -> u64 {
        self.files.values().map(|f| f.len() as u64).sum()
    }
}

impl Default for MemFileSystem {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

fn in_dir<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(dir)?.strip_prefix('/')?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

impl FileSystem for MemFileSystem {
    fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, FsError> {
        // BTreeMap iteration is already sorted by path
        self.files
            .iter()
            .filter(|(path, _)| in_dir(path, dir).is_some())
            .map(|(path, data)| {
                Ok(FileInfo {
                    path: path_from(path)?,
                    size: data.len() as u64,
                })
            })
            .collect()
    }

    fn file_size(&mut self, path: &str) -> Result<Option<u64>, FsError> {
        Ok(self.files.get(path).map(|f| f.len() as u64))
    }

    fn append(&mut self, path: &str, data: &[u8]) -> Result<usize, FsError> {
        self.append_calls += 1;

        if self.failing_appends > 0 {
            self.failing_appends -= 1;
            return Err(FsError::Io(detail("injected append failure")));
        }
        if self.used() + data.len() as u64 > self.capacity_bytes {
            return Err(FsError::NoSpace);
        }

        let len = self.short_write.take().unwrap_or(data.len()).min(data.len());
        self.files
            .entry(String::from(path))
            .or_default()
            .extend_from_slice(&data[..len]);
        Ok(len)
    }

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let file = self.files.get(path).ok_or(FsError::NotFound)?;
        let start = (offset as usize).min(file.len());
        let len = buf.len().min(file.len() - start);
        buf[..len].copy_from_slice(&file[start..start + len]);
        Ok(len)
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        self.files.remove(path).map(|_| ()).ok_or(FsError::NotFound)
    }

    fn usage(&mut self) -> Result<FsUsage, FsError> {
        Ok(FsUsage {
            total_bytes: self.capacity_bytes,
            used_bytes: self.used(),
        })
    }
}
