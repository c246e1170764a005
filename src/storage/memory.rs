//! In-memory storage with fault injection.
//!
//! Behaves like `LocalStorage` (busy checks, append semantics, recursive
//! delete) without touching the disk, and can be told to fail specific
//! writes or closes.

use super::{StorageHandle, StorageService};
use crate::error::StorageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    open: HashMap<u64, PathBuf>,
    next_id: u64,
    failing_writes: HashSet<PathBuf>,
    failing_closes: HashSet<PathBuf>,
    fail_next_writes: usize,
    write_calls: usize,
}

impl MemoryState {
    fn is_open(&self, path: &Path) -> bool {
        self.open.values().any(|open| open == path)
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write to `path` fails until `clear_failures`
    pub fn fail_writes_to(&self, path: impl Into<PathBuf>) {
        self.state.lock().failing_writes.insert(path.into());
    }

    /// Closing `path` releases the handle but reports an error
    pub fn fail_close_of(&self, path: impl Into<PathBuf>) {
        self.state.lock().failing_closes.insert(path.into());
    }

    /// The next `count` writes fail, whatever their target
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().fail_next_writes = count;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_writes.clear();
        state.failing_closes.clear();
        state.fail_next_writes = 0;
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    pub fn contents_string(&self, path: &Path) -> Option<String> {
        self.contents(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Number of `write` calls that reached this storage
    pub fn write_calls(&self) -> usize {
        self.state.lock().write_calls
    }

    pub fn open_handles(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.state.lock().files.keys().cloned().collect()
    }
}

#[async_trait]
impl StorageService for MemoryStorage {
    async fn create_dir(&self, path: &Path) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            state.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    async fn open(&self, path: &Path) -> Result<StorageHandle, StorageError> {
        let mut state = self.state.lock();
        if state.is_open(path) {
            return Err(StorageError::FileBusy(path.to_path_buf()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !state.dirs.contains(parent) {
                return Err(StorageError::NotFound(parent.to_path_buf()));
            }
        }
        state.files.entry(path.to_path_buf()).or_default();
        let id = state.next_id;
        state.next_id += 1;
        state.open.insert(id, path.to_path_buf());
        Ok(StorageHandle::new(id, path.to_path_buf()))
    }

    async fn write(&self, handle: &StorageHandle, bytes: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.write_calls += 1;
        let path = state
            .open
            .get(&handle.id())
            .cloned()
            .ok_or(StorageError::UnknownHandle(handle.id()))?;
        if state.failing_writes.contains(&path) {
            return Err(StorageError::Injected(format!("write to {}", path.display())));
        }
        if state.fail_next_writes > 0 {
            state.fail_next_writes -= 1;
            return Err(StorageError::Injected(format!("write to {}", path.display())));
        }
        state.files.entry(path).or_default().extend_from_slice(bytes);
        Ok(())
    }

    async fn close(&self, handle: &StorageHandle) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let Some(path) = state.open.remove(&handle.id()) else {
            return Ok(());
        };
        if state.failing_closes.contains(&path) {
            return Err(StorageError::Injected(format!("close of {}", path.display())));
        }
        Ok(())
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.open.values().any(|open| open.starts_with(path)) {
            return Err(StorageError::FileBusy(path.to_path_buf()));
        }
        if state.files.remove(path).is_some() {
            return Ok(());
        }
        if !state.dirs.contains(path) {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }

        let has_children = state.files.keys().any(|f| f.starts_with(path))
            || state.dirs.iter().any(|d| d != path && d.starts_with(path));
        if has_children && !recursive {
            return Err(StorageError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::Other, "directory not empty"),
            ));
        }

        state.files.retain(|f, _| !f.starts_with(path));
        state.dirs.retain(|d| !d.starts_with(path));
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        let state = self.state.lock();
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        let state = self.state.lock();
        if state.is_open(path) {
            return Err(StorageError::FileBusy(path.to_path_buf()));
        }
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))
    }
}
