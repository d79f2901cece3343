//! Ledgers of what prepare scripts consulted about their product.
//!
//! A script that enumerates `product.artifacts.obj` depends on the set of
//! `obj` artifacts, not on any property. Recording which tags (and which
//! dependency names) were consulted lets a re-resolve notice when such a
//! set changes without re-running every prepare script.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::resolved::FileTag;

/// Current artifact paths of a product, grouped by tag.
pub type ArtifactsByTag = BTreeMap<FileTag, BTreeSet<PathBuf>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedArtifacts {
  pub all_tags: BTreeSet<FileTag>,
  pub requested_tags: BTreeMap<FileTag, BTreeSet<PathBuf>>,
  /// A script iterated over every tag of the product.
  pub artifacts_enumerated: bool,
}

impl RequestedArtifacts {
  pub fn is_empty(&self) -> bool {
    self.requested_tags.is_empty() && !self.artifacts_enumerated
  }

  /// Records that artifacts with `tag` were requested and what was returned.
  pub fn record_tag(&mut self, tag: FileTag, paths: BTreeSet<PathBuf>) {
    if !paths.is_empty() {
      self.all_tags.insert(tag.clone());
    }
    self.requested_tags.insert(tag, paths);
  }

  /// Records that the full tag set of the product was enumerated.
  pub fn record_enumeration(&mut self, current: &ArtifactsByTag) {
    self.artifacts_enumerated = true;
    self.all_tags = non_empty_tags(current);
  }

  pub fn merge(&mut self, other: RequestedArtifacts) {
    if other.artifacts_enumerated {
      self.artifacts_enumerated = true;
    }
    self.all_tags.extend(other.all_tags);
    self.requested_tags.extend(other.requested_tags);
  }

  /// True if every recorded request would return the same answer against `current`.
  pub fn is_up_to_date(&self, current: &ArtifactsByTag) -> bool {
    if self.artifacts_enumerated && non_empty_tags(current) != self.all_tags {
      return false;
    }

    self.requested_tags.iter().all(|(tag, paths)| match current.get(tag) {
      Some(now) => now == paths,
      None => paths.is_empty(),
    })
  }
}

fn non_empty_tags(current: &ArtifactsByTag) -> BTreeSet<FileTag> {
  current
    .iter()
    .filter(|(_, paths)| !paths.is_empty())
    .map(|(tag, _)| tag.clone())
    .collect()
}

/// Dependency names looked up by scripts, with whether each was present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedDependencies {
  pub names: BTreeMap<String, bool>,
}

impl RequestedDependencies {
  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn record(&mut self, name: impl Into<String>, present: bool) {
    self.names.insert(name.into(), present);
  }

  pub fn merge(&mut self, other: RequestedDependencies) {
    self.names.extend(other.names);
  }

  pub fn is_up_to_date(&self, current: &BTreeSet<String>) -> bool {
    self.names.iter().all(|(name, present)| current.contains(name) == *present)
  }
}
