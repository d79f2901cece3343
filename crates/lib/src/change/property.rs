use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
  Module,
  Product,
  /// `product_name` holds the project name.
  Project,
  /// `module_name` holds the dependency name.
  Parameters,
  /// `module_name` is empty for plain artifact properties.
  Artifact,
}

/// A property read snapshot. Equality, ordering and hashing ignore `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
  pub product_name: String,
  pub module_name: String,
  pub property_name: String,
  pub value: Value,
  pub kind: PropertyKind,
}

impl Property {
  pub fn new(
    kind: PropertyKind,
    product_name: impl Into<String>,
    module_name: impl Into<String>,
    property_name: impl Into<String>,
    value: Value,
  ) -> Self {
    Self {
      product_name: product_name.into(),
      module_name: module_name.into(),
      property_name: property_name.into(),
      value,
      kind,
    }
  }

  fn key(&self) -> (PropertyKind, &str, &str, &str) {
    (self.kind, &self.product_name, &self.module_name, &self.property_name)
  }
}

impl PartialEq for Property {
  fn eq(&self, other: &Self) -> bool {
    self.key() == other.key()
  }
}

impl Eq for Property {}

impl PartialOrd for Property {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Property {
  fn cmp(&self, other: &Self) -> Ordering {
    self.key().cmp(&other.key())
  }
}

impl Hash for Property {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.key().hash(state);
  }
}

impl std::fmt::Display for Property {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kind = match self.kind {
      PropertyKind::Module => "module",
      PropertyKind::Product => "product",
      PropertyKind::Project => "project",
      PropertyKind::Parameters => "parameters",
      PropertyKind::Artifact => "artifact",
    };
    if self.module_name.is_empty() {
      write!(f, "{kind} {}.{}", self.product_name, self.property_name)
    } else {
      write!(f, "{kind} {}.{}.{}", self.product_name, self.module_name, self.property_name)
    }
  }
}

/// Everything a script read while building commands or running a prepare step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyReads {
  #[serde(default)]
  pub properties: BTreeSet<Property>,
  /// Properties read from named artifacts, keyed by artifact path.
  #[serde(default)]
  pub artifact_properties: BTreeMap<PathBuf, BTreeSet<Property>>,
  #[serde(default)]
  pub imported_files: BTreeSet<PathBuf>,
  /// Dependency names consulted, `None` if the dependency list was never read.
  #[serde(default)]
  pub dependencies: Option<BTreeSet<String>>,
}

impl PropertyReads {
  pub fn is_empty(&self) -> bool {
    self.properties.is_empty()
      && self.artifact_properties.is_empty()
      && self.imported_files.is_empty()
      && self.dependencies.is_none()
  }

  /// Records a read; the first observed value wins.
  pub fn record(&mut self, property: Property) {
    self.properties.insert(property);
  }

  pub fn record_artifact(&mut self, path: PathBuf, property: Property) {
    self.artifact_properties.entry(path).or_default().insert(property);
  }

  pub fn merge(&mut self, other: PropertyReads) {
    for p in other.properties {
      self.properties.insert(p);
    }
    for (path, props) in other.artifact_properties {
      let entry = self.artifact_properties.entry(path).or_default();
      for p in props {
        entry.insert(p);
      }
    }
    self.imported_files.extend(other.imported_files);
    if let Some(deps) = other.dependencies {
      self.dependencies.get_or_insert_with(BTreeSet::new).extend(deps);
    }
  }
}
