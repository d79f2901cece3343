//! File resources tracked by the build graph and the scan cache.
//!
//! A [`FileResource`] has an immutable path and a mutable timestamp that is
//! cleared on invalidation and refreshed from disk on demand.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Modification time in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTime(pub u64);

impl FileTime {
  pub fn now() -> Self {
    Self::from_system_time(SystemTime::now())
  }

  pub fn from_system_time(time: SystemTime) -> Self {
    let nanos = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    FileTime(u64::try_from(nanos).unwrap_or(u64::MAX))
  }

  /// Reads the modification time of `path`; `None` if it does not exist.
  pub fn of(path: &Path) -> Option<Self> {
    fs::metadata(path)
      .and_then(|m| m.modified())
      .ok()
      .map(Self::from_system_time)
  }
}

impl std::fmt::Display for FileTime {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileResourceKind {
  /// A file discovered by a scanner (header, import).
  Dependency,
  /// A source or generated artifact owned by the build graph.
  Artifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResource {
  path: PathBuf,
  kind: FileResourceKind,
  #[serde(default)]
  timestamp: Option<FileTime>,
}

impl FileResource {
  pub fn new(path: impl Into<PathBuf>, kind: FileResourceKind) -> Self {
    Self {
      path: path.into(),
      kind,
      timestamp: None,
    }
  }

  pub fn artifact(path: impl Into<PathBuf>) -> Self {
    Self::new(path, FileResourceKind::Artifact)
  }

  pub fn dependency(path: impl Into<PathBuf>) -> Self {
    Self::new(path, FileResourceKind::Dependency)
  }

  pub fn kind(&self) -> FileResourceKind {
    self.kind
  }

  pub fn file_path(&self) -> &Path {
    &self.path
  }

  pub fn dir_path(&self) -> &Path {
    self.path.parent().unwrap_or_else(|| Path::new(""))
  }

  pub fn file_name(&self) -> &str {
    self.path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
  }

  /// File name up to the first dot: `foo` for `foo.tar.gz`.
  pub fn base_name(&self) -> &str {
    let name = self.file_name();
    name.split_once('.').map(|(base, _)| base).unwrap_or(name)
  }

  /// File name up to the last dot: `foo.tar` for `foo.tar.gz`.
  pub fn complete_base_name(&self) -> &str {
    let name = self.file_name();
    name.rsplit_once('.').map(|(base, _)| base).unwrap_or(name)
  }

  /// Text after the last dot, without the dot; empty if there is none.
  pub fn suffix(&self) -> &str {
    let name = self.file_name();
    name.rsplit_once('.').map(|(_, suffix)| suffix).unwrap_or_default()
  }

  pub fn timestamp(&self) -> Option<FileTime> {
    self.timestamp
  }

  pub fn set_timestamp(&mut self, timestamp: FileTime) {
    self.timestamp = Some(timestamp);
  }

  pub fn clear_timestamp(&mut self) {
    self.timestamp = None;
  }

  /// Re-reads the timestamp from disk, clearing it if the file is gone.
  pub fn refresh_timestamp(&mut self) -> Option<FileTime> {
    self.timestamp = FileTime::of(&self.path);
    self.timestamp
  }

  pub fn exists(&self) -> bool {
    self.path.exists()
  }
}
