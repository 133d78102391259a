//! Byte-level file access used by storages
//!
//! Storages never touch the filesystem directly; they go through a
//! [`FileSurface`] keyed by the resolved file path. The local surface maps
//! to disk, the in-memory one backs tests and hosts without a filesystem.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Byte-addressable key-value view of files
pub trait FileSurface: Send + Sync {
    /// File content, `Ok(None)` if the file does not exist
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the content of `path`, creating parent directories as needed
    fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    fn delete(&self, path: &str) -> Result<()>;

    fn is_writable(&self, path: &str) -> bool;
}

/// Files on the local disk. Relative paths resolve against `base`.
#[derive(Debug, Clone)]
pub struct LocalFileSurface {
    base: PathBuf,
}

impl LocalFileSurface {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        }
    }
}

impl FileSurface for LocalFileSurface {
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full = self.resolve(path);
        match fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(full, e)),
        }
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if !self.is_writable(path) {
            return Err(StoreError::ReadOnlyModification {
                file: path.to_string(),
            });
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        match fs::write(&full, content) {
            Ok(()) => {
                debug!(file = %full.display(), bytes = content.len(), "Wrote storage file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(StoreError::ReadOnlyModification {
                    file: path.to_string(),
                })
            }
            Err(e) => Err(StoreError::io(full, e)),
        }
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(full, e)),
        }
    }

    fn is_writable(&self, path: &str) -> bool {
        match fs::metadata(self.resolve(path)) {
            Ok(meta) => !meta.permissions().readonly(),
            // Missing files are created on write
            Err(_) => true,
        }
    }
}

/// Files kept in memory, with read-only marking and write counting
#[derive(Debug, Default)]
pub struct MemoryFileSurface {
    files: RwLock<HashMap<String, Vec<u8>>>,
    read_only: RwLock<HashSet<String>>,
    writes: AtomicUsize,
}

impl MemoryFileSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.files.write().insert(path.to_string(), content.into());
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.files.read().get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.read().contains_key(path)
    }

    pub fn set_read_only(&self, path: &str, read_only: bool) {
        let mut set = self.read_only.write();
        if read_only {
            set.insert(path.to_string());
        } else {
            set.remove(path);
        }
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl FileSurface for MemoryFileSurface {
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.content(path))
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if !self.is_writable(path) {
            return Err(StoreError::ReadOnlyModification {
                file: path.to_string(),
            });
        }
        self.files.write().insert(path.to_string(), content.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.files.write().remove(path);
        Ok(())
    }

    fn is_writable(&self, path: &str) -> bool {
        !self.read_only.read().contains(path)
    }
}
