//! Record store filesystem backed by a host directory.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use aqualog_core::error::detail_of;
use aqualog_core::storage::{FileInfo, FileSystem, FsError, FsUsage, path_from};

fn io_error(e: io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound,
        _ => FsError::Io(detail_of(e)),
    }
}

/// Maps `/dir/name` paths below `root`, with a simulated capacity.
pub struct DirFileSystem {
    root: PathBuf,
    capacity_bytes: u64,
}

impl DirFileSystem {
    pub fn new(root: impl Into<PathBuf>, capacity_bytes: u64) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            capacity_bytes,
        })
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn used_bytes(&self) -> io::Result<u64> {
        let mut used = 0;
        for dir in fs::read_dir(&self.root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(dir.path())? {
                used += file?.metadata()?.len();
            }
        }
        Ok(used)
    }
}

impl FileSystem for DirFileSystem {
    fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, FsError> {
        let entries = match fs::read_dir(self.host_path(dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error)?;
            let meta = entry.metadata().map_err(io_error)?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name();
            let path = path_from(&format!("{}/{}", dir, name.to_string_lossy()))?;
            files.push(FileInfo {
                path,
                size: meta.len(),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn file_size(&mut self, path: &str) -> Result<Option<u64>, FsError> {
        match fs::metadata(self.host_path(path)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    fn append(&mut self, path: &str, data: &[u8]) -> Result<usize, FsError> {
        if self.used_bytes().map_err(io_error)? + data.len() as u64 > self.capacity_bytes {
            return Err(FsError::NoSpace);
        }

        let host = self.host_path(path);
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(host)
            .map_err(io_error)?;
        file.write_all(data).map_err(io_error)?;
        Ok(data.len())
    }

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut file = fs::File::open(self.host_path(path)).map_err(io_error)?;
        file.seek(SeekFrom::Start(offset)).map_err(io_error)?;

        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]).map_err(io_error)? {
                0 => break,
                n => read += n,
            }
        }
        Ok(read)
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        fs::remove_file(self.host_path(path)).map_err(io_error)
    }

    fn usage(&mut self) -> Result<FsUsage, FsError> {
        Ok(FsUsage {
            total_bytes: self.capacity_bytes,
            used_bytes: self.used_bytes().map_err(io_error)?,
        })
    }
}
