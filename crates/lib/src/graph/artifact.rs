use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::file::FileResource;
use crate::resolved::{FileTag, InstallSpec, PropertyMap};

use super::TransformerId;

/// Stable handle of an artifact in the build graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub u32);

impl fmt::Display for ArtifactId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "a{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
  Source,
  Generated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
  pub id: ArtifactId,
  pub file: FileResource,
  pub product: String,
  pub origin: ArtifactOrigin,
  pub file_tags: BTreeSet<FileTag>,
  #[serde(default)]
  pub properties: PropertyMap,
  #[serde(default)]
  pub producer: Option<TransformerId>,
  #[serde(default)]
  pub consumers: BTreeSet<TransformerId>,
  #[serde(default)]
  pub always_updated: bool,
  #[serde(default)]
  pub install: Option<InstallSpec>,
  #[serde(default)]
  pub may_not_exist: bool,
  /// Files a scanner found this artifact to depend on.
  #[serde(default)]
  pub dependencies: Vec<FileResource>,
}

impl Artifact {
  pub fn path(&self) -> &Path {
    self.file.file_path()
  }

  pub fn is_generated(&self) -> bool {
    self.origin == ArtifactOrigin::Generated
  }

  pub fn has_tag(&self, tag: &FileTag) -> bool {
    self.file_tags.contains(tag)
  }

  pub fn has_any_tag(&self, tags: &BTreeSet<FileTag>) -> bool {
    !self.file_tags.is_disjoint(tags)
  }

  /// Looks up `module.name`, or a plain property when `module` is empty. Missing reads as null.
  pub fn property(&self, module: &str, name: &str) -> Value {
    let found = if module.is_empty() {
      self.properties.get(name)
    } else {
      self.properties.get(module).and_then(|m| m.get(name))
    };
    found.cloned().unwrap_or(Value::Null)
  }
}

/// Data for a new arena entry; the graph assigns the id.
#[derive(Debug, Clone)]
pub struct NewArtifact {
  pub file: FileResource,
  pub product: String,
  pub origin: ArtifactOrigin,
  pub file_tags: BTreeSet<FileTag>,
  pub properties: PropertyMap,
  pub always_updated: bool,
  pub install: Option<InstallSpec>,
  pub may_not_exist: bool,
}

impl NewArtifact {
  pub fn source(product: impl Into<String>, path: impl AsRef<Path>, file_tags: BTreeSet<FileTag>) -> Self {
    Self {
      file: FileResource::artifact(path.as_ref()),
      product: product.into(),
      origin: ArtifactOrigin::Source,
      file_tags,
      properties: PropertyMap::new(),
      always_updated: false,
      install: None,
      may_not_exist: false,
    }
  }

  pub fn generated(product: impl Into<String>, path: impl AsRef<Path>, file_tags: BTreeSet<FileTag>) -> Self {
    Self {
      origin: ArtifactOrigin::Generated,
      always_updated: true,
      ..Self::source(product, path, file_tags)
    }
  }

  pub(super) fn into_artifact(self, id: ArtifactId) -> Artifact {
    Artifact {
      id,
      file: self.file,
      product: self.product,
      origin: self.origin,
      file_tags: self.file_tags,
      properties: self.properties,
      producer: None,
      consumers: BTreeSet::new(),
      always_updated: self.always_updated,
      install: self.install,
      may_not_exist: self.may_not_exist,
      dependencies: Vec::new(),
    }
  }
}
