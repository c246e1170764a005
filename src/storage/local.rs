//! File-system backed storage using `tokio::fs`.

use super::{StorageHandle, StorageService};
use crate::error::StorageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

struct OpenFile {
    path: PathBuf,
    file: Arc<tokio::sync::Mutex<File>>,
}

#[derive(Default)]
pub struct LocalStorage {
    next_id: AtomicU64,
    open_files: Mutex<HashMap<u64, OpenFile>>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_open(&self, path: &Path) -> bool {
        self.open_files.lock().values().any(|open| open.path == path)
    }

    fn file(&self, handle: &StorageHandle) -> Result<Arc<tokio::sync::Mutex<File>>, StorageError> {
        self.open_files
            .lock()
            .get(&handle.id())
            .map(|open| open.file.clone())
            .ok_or(StorageError::UnknownHandle(handle.id()))
    }
}

fn map_io(path: &Path, error: std::io::Error) -> StorageError {
    if error.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.to_path_buf())
    } else {
        StorageError::io(path, error)
    }
}

#[async_trait]
impl StorageService for LocalStorage {
    async fn create_dir(&self, path: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(path).await.map_err(|e| map_io(path, e))
    }

    async fn open(&self, path: &Path) -> Result<StorageHandle, StorageError> {
        if self.is_open(path) {
            return Err(StorageError::FileBusy(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| map_io(path, e))?;

        let mut open_files = self.open_files.lock();
        // Another task may have opened the same path while we were waiting
        if open_files.values().any(|open| open.path == path) {
            return Err(StorageError::FileBusy(path.to_path_buf()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        open_files.insert(
            id,
            OpenFile {
                path: path.to_path_buf(),
                file: Arc::new(tokio::sync::Mutex::new(file)),
            },
        );
        log::debug!("Opened {} as handle {}", path.display(), id);
        Ok(StorageHandle::new(id, path.to_path_buf()))
    }

    async fn write(&self, handle: &StorageHandle, bytes: &[u8]) -> Result<(), StorageError> {
        let file = self.file(handle)?;
        let mut file = file.lock().await;
        file.write_all(bytes)
            .await
            .map_err(|e| StorageError::io(handle.path(), e))?;
        // tokio buffers internally; hand the bytes to the OS before acking
        file.flush()
            .await
            .map_err(|e| StorageError::io(handle.path(), e))
    }

    async fn close(&self, handle: &StorageHandle) -> Result<(), StorageError> {
        let Some(open) = self.open_files.lock().remove(&handle.id()) else {
            return Ok(());
        };
        let mut file = open.file.lock().await;
        file.flush()
            .await
            .map_err(|e| StorageError::io(&open.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| StorageError::io(&open.path, e))?;
        log::debug!("Closed {}", handle);
        Ok(())
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<(), StorageError> {
        let busy = self
            .open_files
            .lock()
            .values()
            .any(|open| open.path.starts_with(path));
        if busy {
            return Err(StorageError::FileBusy(path.to_path_buf()));
        }
        let metadata = fs::metadata(path).await.map_err(|e| map_io(path, e))?;
        let result = if !metadata.is_dir() {
            fs::remove_file(path).await
        } else if recursive {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_dir(path).await
        };
        result.map_err(|e| map_io(path, e))
    }

    async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        match fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        if self.is_open(path) {
            return Err(StorageError::FileBusy(path.to_path_buf()));
        }
        fs::read(path).await.map_err(|e| map_io(path, e))
    }
}
