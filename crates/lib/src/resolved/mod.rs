//! The resolved project model consumed by the build graph engine.
//!
//! These types are produced by the project description evaluator and read
//! here as JSON. Identity across reloads is by product name, rule name and
//! absolute artifact path.

mod rule;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use rule::{ArtifactTemplate, Rule};

/// Free-form configuration values, keyed by property name.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

fn default_true() -> bool {
  true
}

/// A label classifying an artifact's role (`cpp`, `obj`, `application`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTag(pub String);

impl FileTag {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for FileTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for FileTag {
  fn from(value: &str) -> Self {
    FileTag(value.to_string())
  }
}

impl From<String> for FileTag {
  fn from(value: String) -> Self {
    FileTag(value)
  }
}

/// Builds a tag set from string literals.
pub fn tags<I, S>(items: I) -> BTreeSet<FileTag>
where
  I: IntoIterator<Item = S>,
  S: Into<FileTag>,
{
  items.into_iter().map(Into::into).collect()
}

/// Where a script or rule was declared in the project sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLocation {
  #[serde(default)]
  pub file: PathBuf,
  #[serde(default)]
  pub line: u32,
  #[serde(default)]
  pub column: u32,
}

impl CodeLocation {
  pub fn new(file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
    Self {
      file: file.into(),
      line,
      column,
    }
  }
}

impl fmt::Display for CodeLocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.file.as_os_str().is_empty() {
      return f.write_str("<unknown>");
    }
    write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
  }
}

/// A script body plus the library files it imports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
  pub source: String,
  #[serde(default)]
  pub imports: Vec<PathBuf>,
  #[serde(default)]
  pub location: CodeLocation,
}

impl Script {
  pub fn new(source: impl Into<String>) -> Self {
    Self {
      source: source.into(),
      ..Default::default()
    }
  }

  pub fn at(mut self, location: CodeLocation) -> Self {
    self.location = location;
    self
  }

  pub fn is_blank(&self) -> bool {
    self.source.trim().is_empty()
  }
}

/// Install location of an artifact, relative to the install root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
  #[serde(default)]
  pub prefix: PathBuf,
  #[serde(default)]
  pub dir: PathBuf,
  /// Keep the artifact's path relative to this directory instead of just its file name.
  #[serde(default)]
  pub source_base: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProject {
  pub name: String,
  #[serde(default)]
  pub properties: PropertyMap,
  #[serde(default)]
  pub products: Vec<ResolvedProduct>,
  #[serde(default)]
  pub sub_projects: Vec<ResolvedProject>,
}

impl ResolvedProject {
  /// Every product in this project tree, paired with the name of the project declaring it.
  pub fn all_products(&self) -> Vec<(&str, &ResolvedProduct)> {
    let mut out = Vec::new();
    self.collect_products(&mut out);
    out
  }

  fn collect_products<'a>(&'a self, out: &mut Vec<(&'a str, &'a ResolvedProduct)>) {
    for product in &self.products {
      out.push((self.name.as_str(), product));
    }
    for sub in &self.sub_projects {
      sub.collect_products(out);
    }
  }

  /// Every project in this tree, including `self`.
  pub fn all_projects(&self) -> Vec<&ResolvedProject> {
    let mut out = vec![self];
    for sub in &self.sub_projects {
      out.extend(sub.all_projects());
    }
    out
  }

  pub fn find_product(&self, name: &str) -> Option<&ResolvedProduct> {
    self.all_products().into_iter().map(|(_, p)| p).find(|p| p.name == name)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProduct {
  pub name: String,
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Product type: artifacts carrying any of these tags are the product's targets.
  #[serde(default)]
  pub file_tags: BTreeSet<FileTag>,
  /// Build directory relative to the project build directory; defaults to the product name.
  #[serde(default)]
  pub build_directory: Option<PathBuf>,
  #[serde(default)]
  pub properties: PropertyMap,
  #[serde(default)]
  pub modules: Vec<ResolvedModule>,
  /// Per-dependency parameter maps, keyed by dependency name.
  #[serde(default)]
  pub module_parameters: BTreeMap<String, PropertyMap>,
  #[serde(default)]
  pub dependencies: Vec<String>,
  #[serde(default)]
  pub rules: Vec<Rule>,
  #[serde(default)]
  pub sources: Vec<SourceArtifact>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedModule {
  pub name: String,
  #[serde(default)]
  pub properties: PropertyMap,
  /// Module whose properties act as defaults for this one.
  #[serde(default)]
  pub inherits: Option<String>,
  #[serde(default)]
  pub dependencies: Vec<String>,
  #[serde(default)]
  pub setup_build_environment: Option<Script>,
  #[serde(default)]
  pub setup_run_environment: Option<Script>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceArtifact {
  pub path: PathBuf,
  #[serde(default)]
  pub file_tags: BTreeSet<FileTag>,
  /// Module-keyed properties: `{"cpp": {"defines": [...]}}`; top-level keys are plain properties.
  #[serde(default)]
  pub properties: PropertyMap,
  #[serde(default)]
  pub install: Option<InstallSpec>,
  /// Tolerate the file not existing yet at resolve time.
  #[serde(default)]
  pub may_not_exist: bool,
}

impl SourceArtifact {
  pub fn new(path: impl AsRef<Path>, file_tags: BTreeSet<FileTag>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      file_tags,
      ..Default::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deserialize_minimal_project() {
    let json = r#"{
      "name": "hello",
      "products": [
        {
          "name": "app",
          "file_tags": ["application"],
          "sources": [{ "path": "/src/main.c", "file_tags": ["c"] }],
          "rules": [
            { "name": "compiler", "inputs": ["c"], "prepare": { "source": "return {}" } }
          ]
        }
      ]
    }"#;

    let project: ResolvedProject = serde_json::from_str(json).unwrap();
    let product = &project.products[0];
    assert!(product.enabled);
    assert_eq!(product.sources[0].file_tags, tags(["c"]));
    assert!(product.rules[0].requires_inputs);
    assert!(!product.rules[0].multiplex);
  }

  #[test]
  fn all_products_walks_sub_projects() {
    let project = ResolvedProject {
      name: "top".to_string(),
      products: vec![ResolvedProduct {
        name: "a".to_string(),
        ..Default::default()
      }],
      sub_projects: vec![ResolvedProject {
        name: "sub".to_string(),
        products: vec![ResolvedProduct {
          name: "b".to_string(),
          ..Default::default()
        }],
        ..Default::default()
      }],
      ..Default::default()
    };

    let names: Vec<_> = project.all_products().iter().map(|(proj, p)| (*proj, p.name.as_str())).collect();
    assert_eq!(names, vec![("top", "a"), ("sub", "b")]);
    assert!(project.find_product("b").is_some());
    assert_eq!(project.all_projects().len(), 2);
  }

  #[test]
  fn code_location_display() {
    assert_eq!(CodeLocation::new("rules.lua", 12, 3).to_string(), "rules.lua:12:3");
    assert_eq!(CodeLocation::default().to_string(), "<unknown>");
  }
}
