//! # Storage Service Module
//!
//! The recorder never touches the file system directly. Everything goes
//! through a `StorageService`: an asynchronous capability that can open,
//! append to, close, read and delete named byte streams.
//!
//! ## Implementations
//! - `LocalStorage`: real files through `tokio::fs`
//! - `MemoryStorage`: in-memory files with fault injection, used by tests
//!
//! ## Contract
//! - `open` creates the file if needed and appends to it
//! - at most one open handle exists per path; a second `open` or a `read`
//!   while it is open fails with `StorageError::FileBusy`
//! - writes on one handle land in call order
//! - `close` on an already closed handle is a no-op
//! - deleting a path that is, or contains, an open file fails with `FileBusy`

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// Opaque token for an open append-only stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageHandle {
    id: u64,
    path: PathBuf,
}

impl StorageHandle {
    pub(crate) fn new(id: u64, path: PathBuf) -> Self {
        Self { id, path }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.path.display())
    }
}

#[async_trait]
pub trait StorageService: Send + Sync {
    /// Create a directory and any missing parents
    async fn create_dir(&self, path: &Path) -> Result<(), StorageError>;

    /// Open `path` for appending, creating it if it does not exist
    async fn open(&self, path: &Path) -> Result<StorageHandle, StorageError>;

    /// Append `bytes` to the stream
    async fn write(&self, handle: &StorageHandle, bytes: &[u8]) -> Result<(), StorageError>;

    /// Flush and release the handle
    async fn close(&self, handle: &StorageHandle) -> Result<(), StorageError>;

    /// Delete a file, or a directory (`recursive` to include its contents)
    async fn delete(&self, path: &Path, recursive: bool) -> Result<(), StorageError>;

    async fn exists(&self, path: &Path) -> Result<bool, StorageError>;

    /// Read a whole file. Fails with `FileBusy` while a handle on it is open.
    async fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError>;
}
