//! Dependency scanners and their result cache.
//!
//! A scanner reads a file and reports the files it depends on plus any
//! tags it should carry in addition to the declared ones. Results are pure
//! functions of file contents and are cached per scanner and path.

mod cache;
mod include;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolved::FileTag;

pub use cache::ScanResultCache;
pub use include::IncludeScanner;

/// Names a scanner in cache keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScannerId(pub String);

impl fmt::Display for ScannerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
  pub dependencies: Vec<PathBuf>,
  pub additional_file_tags: BTreeSet<FileTag>,
  /// False when the file could not be scanned; such results are never reused.
  pub valid: bool,
}

#[derive(Debug, Error)]
pub enum ScanError {
  #[error("cannot read {} for scanning: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

pub trait Scanner: Send + Sync {
  fn id(&self) -> ScannerId;

  /// Artifacts carrying any of these tags are scanned.
  fn input_tags(&self) -> &BTreeSet<FileTag>;

  /// Scans the contents of `path`.
  fn scan(&self, path: &Path, content: &[u8]) -> ScanResult;
}
