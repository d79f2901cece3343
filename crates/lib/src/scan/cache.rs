use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::{ScanError, ScanResult, Scanner, ScannerId};
use crate::file::FileTime;
use crate::util::hash::{ContentHash, hash_bytes};

#[derive(Debug, Clone)]
struct Entry {
  result: ScanResult,
  timestamp: Option<FileTime>,
  hash: ContentHash,
}

/// Process-wide scan results keyed by scanner and file path.
///
/// An entry is reused while the file's timestamp is unchanged. When the
/// timestamp moved but the content hash did not, the entry is refreshed
/// instead of rescanning.
#[derive(Debug, Default)]
pub struct ScanResultCache {
  entries: Mutex<HashMap<(ScannerId, PathBuf), Entry>>,
}

impl ScanResultCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn scan(&self, scanner: &dyn Scanner, path: &Path) -> Result<ScanResult, ScanError> {
    let key = (scanner.id(), path.to_path_buf());
    let timestamp = FileTime::of(path);

    if let Some(entry) = self.lock().get(&key)
      && entry.result.valid
      && entry.timestamp.is_some()
      && entry.timestamp == timestamp
    {
      return Ok(entry.result.clone());
    }

    let content = std::fs::read(path).map_err(|source| ScanError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let hash = hash_bytes(&content);

    let mut entries = self.lock();
    if let Some(entry) = entries.get_mut(&key)
      && entry.result.valid
      && entry.hash == hash
    {
      entry.timestamp = timestamp;
      return Ok(entry.result.clone());
    }

    debug!(scanner = %key.0, path = %path.display(), "scanning");
    let result = scanner.scan(path, &content);
    entries.insert(
      key,
      Entry {
        result: result.clone(),
        timestamp,
        hash,
      },
    );
    Ok(result)
  }

  /// Drops every cached result for `path`.
  pub fn invalidate(&self, path: &Path) {
    self.lock().retain(|(_, p), _| p != path);
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<(ScannerId, PathBuf), Entry>> {
    self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
