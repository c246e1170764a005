//! Session index: one `name;folderPath` line per finished session.

use crate::error::StorageError;
use crate::storage::StorageService;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub folder: PathBuf,
}

impl IndexEntry {
    pub fn new(name: impl Into<String>, folder: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            folder: folder.into(),
        }
    }

    /// The line written to the index. Separators in the name are replaced.
    pub fn to_line(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| if matches!(c, ';' | '\n' | '\r') { ' ' } else { c })
            .collect();
        format!("{};{}\n", name, self.folder.display())
    }
}

/// Parse index text, skipping lines without a separator
pub fn parse_index(text: &str) -> Vec<IndexEntry> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match line.split_once(';') {
            Some((name, folder)) => Some(IndexEntry::new(name, folder)),
            None => {
                log::warn!("Skipping malformed index line: {:?}", line);
                None
            }
        })
        .collect()
}

/// Append one entry to the index at `path`, creating the file if needed
pub async fn append_entry(
    storage: &dyn StorageService,
    path: &Path,
    entry: &IndexEntry,
) -> Result<(), StorageError> {
    let handle = storage.open(path).await?;
    let written = storage.write(&handle, entry.to_line().as_bytes()).await;
    let closed = storage.close(&handle).await;
    written.and(closed)
}

/// Every finished session listed in the index, oldest first
pub async fn read_index(
    storage: &dyn StorageService,
    path: &Path,
) -> Result<Vec<IndexEntry>, StorageError> {
    if !storage.exists(path).await? {
        return Ok(Vec::new());
    }
    let bytes = storage.read(path).await?;
    Ok(parse_index(&String::from_utf8_lossy(&bytes)))
}
