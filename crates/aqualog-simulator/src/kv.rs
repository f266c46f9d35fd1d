//! Key-value storage as one file per `namespace.key`.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;

use aqualog_core::device_config::{KeyValueStore, KvError};
use aqualog_core::error::detail_of;

pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn file(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}.bin", namespace, key))
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        match fs::read(self.file(namespace, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KvError::Backend(detail_of(e))),
        }
    }

    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<usize, KvError> {
        fs::write(self.file(namespace, key), value).map_err(|e| KvError::Backend(detail_of(e)))?;
        Ok(value.len())
    }
}
