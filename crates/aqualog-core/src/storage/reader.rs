use core::marker::PhantomData;

use alloc::collections::VecDeque;
use alloc::vec;
use log::debug;

use super::{FileSystem, Path, Record, StoreError, decode_record};

/// Forward-only cursor over the chunk files of one store.
///
/// Files are visited in sorted path order, which is creation order. The file
/// list is snapshotted on the first [`next_file`](Self::next_file) call, so
/// files created while draining are left for the next pass.
///
/// Records failing their CRC are still returned; check
/// [`entry_crc_valid`](Self::entry_crc_valid) after each one. Trailing bytes
/// shorter than one record are ignored.
pub struct DataStoreReader<R: Record> {
    dir: &'static str,
    pending_files: Option<VecDeque<Path>>,
    current: Option<Path>,
    offset: u64,
    last_crc_valid: bool,
    _record: PhantomData<R>,
}

impl<R: Record> DataStoreReader<R> {
    pub fn new(dir: &'static str) -> Self {
        Self {
            dir,
            pending_files: None,
            current: None,
            offset: 0,
            last_crc_valid: false,
            _record: PhantomData,
        }
    }

    /// Moves to the next chunk file. Returns false when none are left.
    pub fn next_file<F: FileSystem>(&mut self, fs: &mut F) -> Result<bool, StoreError> {
        if self.pending_files.is_none() {
            let files = fs.list(self.dir)?;
            debug!(" {} chunk files in {}", files.len(), self.dir);
            self.pending_files = Some(files.into_iter().map(|f| f.path).collect());
        }

        self.current = self.pending_files.as_mut().and_then(VecDeque::pop_front);
        self.offset = 0;
        self.last_crc_valid = false;
        Ok(self.current.is_some())
    }

    /// Reads the next record of the current file, `None` at end of file.
    pub fn next_entry<F: FileSystem>(&mut self, fs: &mut F) -> Result<Option<R>, StoreError> {
        let Some(path) = &self.current else {
            return Ok(None);
        };

        let mut buf = vec![0u8; R::SIZE];
        let read = fs.read_at(path, self.offset, &mut buf)?;
        if read < R::SIZE {
            return Ok(None);
        }
        self.offset += R::SIZE as u64;

        Ok(decode_record::<R>(&buf).map(|(record, crc_valid)| {
            self.last_crc_valid = crc_valid;
            record
        }))
    }

    /// Whether the record last returned by `next_entry` passed its CRC check.
    pub fn entry_crc_valid(&self) -> bool {
        self.last_crc_valid
    }

    /// Removes the current chunk file.
    pub fn delete_file<F: FileSystem>(&mut self, fs: &mut F) -> Result<(), StoreError> {
        if let Some(path) = self.current.take() {
            fs.remove(&path)?;
            debug!(" Deleted {}", path);
        }
        Ok(())
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current.as_deref()
    }
}
