use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::change::{ArtifactsByTag, Property, PropertyReads, RequestedArtifacts, RequestedDependencies};
use crate::resolved::FileTag;

/// Receives every read a script performs.
pub trait PropertyObserver: Send + Sync {
  fn property_read(&self, property: Property);

  fn artifact_property_read(&self, path: &Path, property: Property);

  /// `product.artifacts[tag]` was read and returned `paths`.
  fn artifacts_requested(&self, tag: &FileTag, paths: BTreeSet<PathBuf>);

  /// The script iterated over all artifact tags of the product.
  fn artifacts_enumerated(&self, current: &ArtifactsByTag);

  /// A dependency was looked up by name.
  fn dependency_requested(&self, name: &str, present: bool);

  /// The full dependency list was read.
  fn dependencies_read(&self, names: &BTreeSet<String>);

  fn file_imported(&self, path: &Path);
}

/// Discards all reads; used where nothing is tracked, like environment scripts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl PropertyObserver for NullObserver {
  fn property_read(&self, _property: Property) {}
  fn artifact_property_read(&self, _path: &Path, _property: Property) {}
  fn artifacts_requested(&self, _tag: &FileTag, _paths: BTreeSet<PathBuf>) {}
  fn artifacts_enumerated(&self, _current: &ArtifactsByTag) {}
  fn dependency_requested(&self, _name: &str, _present: bool) {}
  fn dependencies_read(&self, _names: &BTreeSet<String>) {}
  fn file_imported(&self, _path: &Path) {}
}

/// Everything recorded during one script evaluation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Recorded {
  pub reads: PropertyReads,
  pub requested_artifacts: RequestedArtifacts,
  pub requested_dependencies: RequestedDependencies,
}

/// Collects reads into [`PropertyReads`] and the requested-artifact ledgers.
#[derive(Debug, Default)]
pub struct PropertyRecorder {
  state: Mutex<Recorded>,
}

impl PropertyRecorder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns what was recorded so far and resets the recorder.
  pub fn take(&self) -> Recorded {
    std::mem::take(&mut *self.lock())
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl PropertyObserver for PropertyRecorder {
  fn property_read(&self, property: Property) {
    self.lock().reads.record(property);
  }

  fn artifact_property_read(&self, path: &Path, property: Property) {
    self.lock().reads.record_artifact(path.to_path_buf(), property);
  }

  fn artifacts_requested(&self, tag: &FileTag, paths: BTreeSet<PathBuf>) {
    self.lock().requested_artifacts.record_tag(tag.clone(), paths);
  }

  fn artifacts_enumerated(&self, current: &ArtifactsByTag) {
    self.lock().requested_artifacts.record_enumeration(current);
  }

  fn dependency_requested(&self, name: &str, present: bool) {
    self.lock().requested_dependencies.record(name, present);
  }

  fn dependencies_read(&self, names: &BTreeSet<String>) {
    self.lock().reads.dependencies = Some(names.clone());
  }

  fn file_imported(&self, path: &Path) {
    self.lock().reads.imported_files.insert(path.to_path_buf());
  }
}
