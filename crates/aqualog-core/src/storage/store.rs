use core::fmt::Write;
use core::marker::PhantomData;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, error, warn};

use super::{FileSystem, FsError, Path, Record, StoreError, encode_record};
use crate::config::{DATA_STORE_BUFFER_ELEMENTS, FILENAME_POSTFIX_MAX, FLUSH_RETRIES};

/// Append-only, chunked record store with a write-behind buffer.
///
/// Records are buffered in RAM and flushed to the newest chunk file under
/// `dir` once the buffer fills or on [`DataStore::commit`]. A chunk file never
/// holds more than `entries_per_file` records; a new one is created when the
/// current file is full or gone.
///
/// Chunk files are named `{dir}/{sequence:010}_{postfix:02}`. The sequence
/// number is one past the highest one on disk, so lexical order is creation
/// order whatever the RTC says. The postfix only moves off `00` if a name is
/// unexpectedly taken.
///
/// ## Flush failures
///
/// A failed append is retried [`FLUSH_RETRIES`] times, then the records stay
/// buffered for the next commit. If the buffer is full and still cannot be
/// flushed, the oldest record is dropped and counted so the newest data wins.
pub struct DataStore<R: Record> {
    dir: &'static str,
    entries_per_file: usize,
    buffer_capacity: usize,
    /// Records not yet written to flash
    buffer: VecDeque<R>,
    /// Chunk file the last flush wrote to
    current_file: Option<Path>,
    /// Sequence number for the next chunk file, read from disk on first use
    next_sequence: Option<u32>,
    dropped: u32,
    _record: PhantomData<R>,
}

impl<R: Record> DataStore<R> {
    pub fn new(dir: &'static str, entries_per_file: usize) -> Self {
        Self::with_buffer_capacity(dir, entries_per_file, DATA_STORE_BUFFER_ELEMENTS)
    }

    pub fn with_buffer_capacity(
        dir: &'static str,
        entries_per_file: usize,
        buffer_capacity: usize,
    ) -> Self {
        let buffer_capacity = buffer_capacity.max(1);
        Self {
            dir,
            entries_per_file: entries_per_file.max(1),
            buffer_capacity,
            buffer: VecDeque::with_capacity(buffer_capacity),
            current_file: None,
            next_sequence: None,
            dropped: 0,
            _record: PhantomData,
        }
    }

    pub fn dir(&self) -> &'static str {
        self.dir
    }

    pub fn entries_per_file(&self) -> usize {
        self.entries_per_file
    }

    /// Size in bytes of a full chunk file.
    pub fn file_capacity_bytes(&self) -> u64 {
        (self.entries_per_file * R::SIZE) as u64
    }

    /// Records buffered in RAM.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Records dropped because the buffer was full and could not be flushed.
    pub fn dropped_records(&self) -> u32 {
        self.dropped
    }

    /// Buffers a record, flushing when the buffer fills.
    ///
    /// The record is always accepted. An error means the forced flush failed
    /// and the data is still in RAM only.
    pub fn add<F: FileSystem>(&mut self, fs: &mut F, record: R) -> Result<(), StoreError> {
        if self.buffer.len() >= self.buffer_capacity {
            // A previous flush failed, make one more attempt before evicting
            if let Err(e) = self.commit(fs) {
                if let Some(oldest) = self.buffer.pop_front() {
                    self.dropped += 1;
                    error!(
                        " Store {} full and flush failing, dropped record ts={}: {:?}",
                        self.dir,
                        oldest.timestamp(),
                        e
                    );
                }
                self.buffer.push_back(record);
                return Err(e);
            }
        }

        self.buffer.push_back(record);

        if self.buffer.len() >= self.buffer_capacity {
            self.commit(fs)?;
        }

        Ok(())
    }

    /// Writes every buffered record to flash.
    ///
    /// Does nothing when the buffer is empty.
    pub fn commit<F: FileSystem>(&mut self, fs: &mut F) -> Result<(), StoreError> {
        while !self.buffer.is_empty() {
            let (path, free) = self.select_file(fs)?;

            let count = free.min(self.buffer.len());
            let mut bytes = Vec::with_capacity(count * R::SIZE);
            for record in self.buffer.iter().take(count) {
                bytes.extend_from_slice(&encode_record(record));
            }

            if let Err(e) = self.append_with_retry(fs, &path, &bytes) {
                if let StoreError::ShortWrite { written, .. } = &e {
                    // Whole records ahead of the tear are on flash and valid
                    self.buffer.drain(..written / R::SIZE);
                }
                return Err(e);
            }
            self.buffer.drain(..count);
            debug!(" Flushed {} records to {}", count, path);
        }

        Ok(())
    }

    /// Deletes every chunk file of this store and drops the buffer.
    ///
    /// Returns the number of files removed.
    pub fn clear_all<F: FileSystem>(&mut self, fs: &mut F) -> Result<usize, StoreError> {
        let files = fs.list(self.dir)?;
        for file in &files {
            fs.remove(&file.path)?;
        }

        self.buffer.clear();
        self.current_file = None;
        self.next_sequence = None;
        Ok(files.len())
    }

    fn append_with_retry<F: FileSystem>(
        &mut self,
        fs: &mut F,
        path: &Path,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let mut last_err = FsError::NotFound;

        for attempt in 1..=FLUSH_RETRIES {
            match fs.append(path, bytes) {
                Ok(written) if written == bytes.len() => return Ok(()),
                Ok(written) => {
                    // The file now ends in a torn record and counts as full
                    self.current_file = None;
                    return Err(StoreError::ShortWrite {
                        expected: bytes.len(),
                        written,
                    });
                }
                Err(e) => {
                    warn!(
                        " Append to {} failed (attempt {}/{}): {:?}",
                        path, attempt, FLUSH_RETRIES, e
                    );
                    last_err = e;
                }
            }
        }

        Err(StoreError::Fs(last_err))
    }

    /// Picks the chunk file to append to and how many records still fit.
    fn select_file<F: FileSystem>(&mut self, fs: &mut F) -> Result<(Path, usize), StoreError> {
        let candidate = match &self.current_file {
            Some(path) => Some(path.clone()),
            None => fs.list(self.dir)?.pop().map(|f| f.path),
        };

        if let Some(path) = candidate {
            if let Some(size) = fs.file_size(&path)? {
                let free = self.free_slots(size);
                if free > 0 {
                    self.current_file = Some(path.clone());
                    return Ok((path, free));
                }
            }
        }

        let path = self.new_file_name(fs)?;
        self.current_file = Some(path.clone());
        Ok((path, self.entries_per_file))
    }

    fn free_slots(&self, size: u64) -> usize {
        let record_size = R::SIZE as u64;
        if size % record_size != 0 {
            // Torn write, never append behind a partial record
            return 0;
        }
        self.entries_per_file
            .saturating_sub((size / record_size) as usize)
    }

    fn new_file_name<F: FileSystem>(&mut self, fs: &mut F) -> Result<Path, StoreError> {
        let sequence = match self.next_sequence {
            Some(sequence) => sequence,
            None => match fs.list(self.dir)?.iter().filter_map(|f| sequence_of(&f.path)).max() {
                Some(last) => last.checked_add(1).ok_or(StoreError::NoFreeFileName)?,
                None => 0,
            },
        };

        for postfix in 0..FILENAME_POSTFIX_MAX {
            let mut path = Path::new();
            write!(path, "{}/{:010}_{:02}", self.dir, sequence, postfix)
                .map_err(|_| FsError::PathTooLong)?;

            if fs.file_size(&path)?.is_none() {
                self.next_sequence = sequence.checked_add(1);
                return Ok(path);
            }
        }

        error!(" No free file name in {} for sequence {}", self.dir, sequence);
        Err(StoreError::NoFreeFileName)
    }
}

/// Sequence number of a chunk file path, `None` for foreign names.
fn sequence_of(path: &str) -> Option<u32> {
    let name = path.rsplit('/').next()?;
    let (sequence, _postfix) = name.split_once('_')?;
    sequence.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::LogEntry;
    use crate::storage::{DataStoreReader, MemFileSystem};

    fn entry(ts: u32) -> LogEntry {
        LogEntry::new(ts, 1, ts, 0)
    }

    fn store() -> DataStore<LogEntry> {
        DataStore::with_buffer_capacity("/t", 4, 3)
    }

    #[test]
    fn test_add_flushes_when_buffer_full() {
        let mut fs = MemFileSystem::default();
        let mut store = store();

        store.add(&mut fs, entry(1)).unwrap();
        store.add(&mut fs, entry(2)).unwrap();
        assert_eq!(fs.append_calls(), 0, "nothing written before the buffer fills");

        store.add(&mut fs, entry(3)).unwrap();
        assert_eq!(store.pending(), 0);
        assert_eq!(fs.paths(), ["/t/0000000000_00"]);
    }

    #[test]
    fn test_commit_idempotent() {
        let mut fs = MemFileSystem::default();
        let mut store = store();
        store.add(&mut fs, entry(1)).unwrap();

        store.commit(&mut fs).unwrap();
        let calls = fs.append_calls();
        store.commit(&mut fs).unwrap();
        store.commit(&mut fs).unwrap();
        assert_eq!(fs.append_calls(), calls, "empty commit must not touch the filesystem");
    }

    #[test]
    fn test_file_capacity_invariant() {
        let mut fs = MemFileSystem::default();
        let mut store = store();
        let n = 11;

        for ts in 0..n {
            store.add(&mut fs, entry(100 + ts)).unwrap();
        }
        store.commit(&mut fs).unwrap();

        let files = fs.list("/t").unwrap();
        let capacity = store.file_capacity_bytes();
        let full = files.iter().filter(|f| f.size == capacity).count();
        let partial: Vec<_> = files.iter().filter(|f| f.size != capacity).collect();

        assert_eq!(full, (n / 4) as usize);
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].size, (n as u64 % 4) * LogEntry::SIZE as u64);
        assert!(files.iter().all(|f| f.size <= capacity));
    }

    #[test]
    fn test_round_trip_through_reader() {
        let mut fs = MemFileSystem::default();
        let mut store = store();
        for ts in 0..6 {
            store.add(&mut fs, entry(ts)).unwrap();
        }
        store.commit(&mut fs).unwrap();

        let mut reader = DataStoreReader::<LogEntry>::new("/t");
        let mut seen = Vec::new();
        while reader.next_file(&mut fs).unwrap() {
            while let Some(rec) = reader.next_entry(&mut fs).unwrap() {
                assert!(reader.entry_crc_valid());
                seen.push(rec);
            }
        }
        let expected: Vec<_> = (0..6).map(entry).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_resumes_newest_file_after_restart() {
        let mut fs = MemFileSystem::default();
        let mut store = store();
        store.add(&mut fs, entry(5)).unwrap();
        store.commit(&mut fs).unwrap();

        // A fresh store instance has no memory of the current file
        let mut store = DataStore::<LogEntry>::with_buffer_capacity("/t", 4, 3);
        store.add(&mut fs, entry(6)).unwrap();
        store.commit(&mut fs).unwrap();

        assert_eq!(fs.paths(), ["/t/0000000000_00"]);
        assert_eq!(
            fs.file_size("/t/0000000000_00").unwrap(),
            Some(2 * LogEntry::SIZE as u64)
        );
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut fs = MemFileSystem::default();
        let mut store = DataStore::<LogEntry>::with_buffer_capacity("/t", 1, 1);
        store.add(&mut fs, entry(9)).unwrap();
        store.add(&mut fs, entry(9)).unwrap();
        assert_eq!(fs.paths(), ["/t/0000000000_00", "/t/0000000001_00"]);
    }

    #[test]
    fn test_names_follow_creation_order_when_clock_jumps_back() {
        let mut fs = MemFileSystem::default();
        let mut store = DataStore::<LogEntry>::with_buffer_capacity("/t", 2, 1);
        store.add(&mut fs, entry(1_700_000_000)).unwrap();
        store.add(&mut fs, entry(1_700_000_060)).unwrap();
        // RTC lost its time: the new file must still sort last
        store.add(&mut fs, entry(12)).unwrap();
        assert_eq!(fs.paths(), ["/t/0000000000_00", "/t/0000000001_00"]);

        // After a restart the half-full file from the bad clock is resumed
        let mut store = DataStore::<LogEntry>::with_buffer_capacity("/t", 2, 1);
        store.add(&mut fs, entry(13)).unwrap();
        assert_eq!(fs.paths(), ["/t/0000000000_00", "/t/0000000001_00"]);
        assert_eq!(
            fs.file_size("/t/0000000001_00").unwrap(),
            Some(2 * LogEntry::SIZE as u64)
        );
    }

    #[test]
    fn test_postfix_avoids_collisions() {
        let mut fs = MemFileSystem::default();
        let mut store = DataStore::<LogEntry>::with_buffer_capacity("/t", 1, 1);
        store.add(&mut fs, entry(1)).unwrap();
        // Taken behind the store's back
        fs.put_raw("/t/0000000001_00", &[0u8; 3]);

        store.add(&mut fs, entry(2)).unwrap();
        assert_eq!(
            fs.file_size("/t/0000000001_01").unwrap(),
            Some(LogEntry::SIZE as u64)
        );
    }

    #[test]
    fn test_no_free_file_name() {
        let mut fs = MemFileSystem::default();
        let mut store = DataStore::<LogEntry>::with_buffer_capacity("/t", 1, 1);
        store.add(&mut fs, entry(1)).unwrap();
        for postfix in 0..FILENAME_POSTFIX_MAX {
            fs.put_raw(&alloc::format!("/t/0000000001_{:02}", postfix), &[0u8; 3]);
        }
        // Current file is full, and every name for the next sequence is taken
        assert_eq!(store.add(&mut fs, entry(2)), Err(StoreError::NoFreeFileName));
        assert_eq!(store.pending(), 1, "record stays buffered");
    }

    #[test]
    fn test_sequence_exhausted() {
        let mut fs = MemFileSystem::default();
        fs.put_raw("/t/4294967295_00", &[0u8; 3]);
        let mut store = DataStore::<LogEntry>::with_buffer_capacity("/t", 1, 1);
        assert_eq!(store.add(&mut fs, entry(1)), Err(StoreError::NoFreeFileName));
    }

    #[test]
    fn test_torn_file_treated_as_full() {
        let mut fs = MemFileSystem::default();
        fs.put_raw("/t/0000000001_00", &[0u8; 5]);
        let mut store = store();
        store.add(&mut fs, entry(2)).unwrap();
        store.commit(&mut fs).unwrap();

        assert_eq!(fs.contents("/t/0000000001_00").unwrap().len(), 5);
        assert_eq!(
            fs.file_size("/t/0000000002_00").unwrap(),
            Some(LogEntry::SIZE as u64)
        );
    }

    #[test]
    fn test_failed_flush_keeps_buffer() {
        let mut fs = MemFileSystem::default();
        let mut store = store();
        store.add(&mut fs, entry(1)).unwrap();

        fs.fail_next_appends(FLUSH_RETRIES);
        assert!(store.commit(&mut fs).is_err());
        assert_eq!(store.pending(), 1, "records must survive a failed flush");
        assert_eq!(fs.append_calls(), FLUSH_RETRIES);

        store.commit(&mut fs).unwrap();
        assert_eq!(store.pending(), 0);
        assert_eq!(store.dropped_records(), 0);
    }

    #[test]
    fn test_flush_retry_recovers_within_bound() {
        let mut fs = MemFileSystem::default();
        let mut store = store();
        store.add(&mut fs, entry(1)).unwrap();

        fs.fail_next_appends(FLUSH_RETRIES - 1);
        store.commit(&mut fs).unwrap();
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn test_full_buffer_drops_oldest_when_flush_keeps_failing() {
        let mut fs = MemFileSystem::default();
        let mut store = store();

        fs.fail_next_appends(usize::MAX);
        store.add(&mut fs, entry(1)).unwrap();
        store.add(&mut fs, entry(2)).unwrap();
        assert!(store.add(&mut fs, entry(3)).is_err());
        assert_eq!(store.pending(), 3);

        assert!(store.add(&mut fs, entry(4)).is_err());
        assert_eq!(store.pending(), 3, "buffer stays bounded");
        assert_eq!(store.dropped_records(), 1);

        fs.fail_next_appends(0);
        store.commit(&mut fs).unwrap();

        let mut reader = DataStoreReader::<LogEntry>::new("/t");
        let mut seen = Vec::new();
        while reader.next_file(&mut fs).unwrap() {
            while let Some(rec) = reader.next_entry(&mut fs).unwrap() {
                seen.push(rec.timestamp);
            }
        }
        assert_eq!(seen, [2, 3, 4], "oldest record is the one evicted");
    }

    #[test]
    fn test_short_write_moves_to_new_file() {
        let mut fs = MemFileSystem::default();
        let mut store = store();
        store.add(&mut fs, entry(1)).unwrap();
        fs.short_write_next(3);
        assert!(matches!(
            store.commit(&mut fs),
            Err(StoreError::ShortWrite { written: 3, .. })
        ));

        store.commit(&mut fs).unwrap();
        assert_eq!(fs.paths(), ["/t/0000000000_00", "/t/0000000001_00"]);
    }

    #[test]
    fn test_short_write_keeps_only_unwritten_records() {
        let mut fs = MemFileSystem::default();
        let mut store = store();
        store.add(&mut fs, entry(1)).unwrap();
        store.add(&mut fs, entry(2)).unwrap();
        fs.short_write_next(2 * LogEntry::SIZE + 3);
        // Third add fills the buffer and triggers the torn flush
        assert!(matches!(
            store.add(&mut fs, entry(3)),
            Err(StoreError::ShortWrite { .. })
        ));
        assert_eq!(store.pending(), 1, "records before the tear are not kept");

        store.commit(&mut fs).unwrap();

        let mut reader = DataStoreReader::<LogEntry>::new("/t");
        let mut seen = Vec::new();
        while reader.next_file(&mut fs).unwrap() {
            while let Some(rec) = reader.next_entry(&mut fs).unwrap() {
                assert!(reader.entry_crc_valid());
                seen.push(rec.timestamp);
            }
        }
        assert_eq!(seen, [1, 2, 3], "each record stored exactly once");
    }

    #[test]
    fn test_clear_all() {
        let mut fs = MemFileSystem::default();
        let mut store = DataStore::<LogEntry>::with_buffer_capacity("/t", 1, 1);
        store.add(&mut fs, entry(1)).unwrap();
        store.add(&mut fs, entry(2)).unwrap();
        fs.put_raw("/other/x", &[1]);

        assert_eq!(store.clear_all(&mut fs).unwrap(), 2);
        assert_eq!(fs.paths(), ["/other/x"]);
    }
}
