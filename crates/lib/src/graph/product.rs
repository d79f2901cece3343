use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::change::{RequestedArtifacts, RequestedDependencies};
use crate::resolved::{FileTag, PropertyMap, ResolvedModule, ResolvedProduct};

use super::{ArtifactId, TransformerId};

/// The slice of a resolved product that scripts can see at build time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductContext {
  pub name: String,
  pub project: String,
  pub build_directory: PathBuf,
  pub file_tags: BTreeSet<FileTag>,
  #[serde(default)]
  pub properties: PropertyMap,
  #[serde(default)]
  pub modules: Vec<ResolvedModule>,
  #[serde(default)]
  pub module_parameters: BTreeMap<String, PropertyMap>,
  #[serde(default)]
  pub dependencies: BTreeSet<String>,
}

impl ProductContext {
  pub fn from_resolved(project: &str, product: &ResolvedProduct, build_root: &Path) -> Self {
    let build_directory = match &product.build_directory {
      Some(dir) if dir.is_absolute() => dir.clone(),
      Some(dir) => build_root.join(dir),
      None => build_root.join(&product.name),
    };

    Self {
      name: product.name.clone(),
      project: project.to_string(),
      build_directory,
      file_tags: product.file_tags.clone(),
      properties: product.properties.clone(),
      modules: product.modules.clone(),
      module_parameters: product.module_parameters.clone(),
      dependencies: product.dependencies.iter().cloned().collect(),
    }
  }

  pub fn module(&self, name: &str) -> Option<&ResolvedModule> {
    self.modules.iter().find(|m| m.name == name)
  }

  pub fn product_property(&self, name: &str) -> Value {
    self.properties.get(name).cloned().unwrap_or(Value::Null)
  }

  /// Resolves `module.name`, walking the `inherits` chain for defaults.
  ///
  /// `None` when the module is not loaded in this product; a missing
  /// property of a loaded module reads as null.
  pub fn module_property(&self, module: &str, name: &str) -> Option<Value> {
    let mut current = self.module(module)?;
    let mut seen = BTreeSet::new();

    loop {
      if let Some(value) = current.properties.get(name) {
        return Some(value.clone());
      }
      if !seen.insert(current.name.as_str()) {
        return Some(Value::Null);
      }
      match current.inherits.as_deref().and_then(|base| self.module(base)) {
        Some(base) => current = base,
        None => return Some(Value::Null),
      }
    }
  }

  /// Resolves a parameter set for `dependency`; `None` when the product no longer depends on it.
  pub fn parameter(&self, dependency: &str, name: &str) -> Option<Value> {
    if !self.dependencies.contains(dependency) && !self.module_parameters.contains_key(dependency) {
      return None;
    }
    Some(
      self
        .module_parameters
        .get(dependency)
        .and_then(|params| params.get(name))
        .cloned()
        .unwrap_or(Value::Null),
    )
  }
}

/// Build data the graph keeps per product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductBuildData {
  pub context: ProductContext,
  #[serde(default)]
  pub artifacts: BTreeSet<ArtifactId>,
  #[serde(default)]
  pub transformers: BTreeSet<TransformerId>,
  #[serde(default)]
  pub requested_artifacts: RequestedArtifacts,
  #[serde(default)]
  pub requested_dependencies: RequestedDependencies,
}

impl ProductBuildData {
  pub fn new(context: ProductContext) -> Self {
    Self {
      context,
      ..Default::default()
    }
  }

  pub fn name(&self) -> &str {
    &self.context.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn module(name: &str, inherits: Option<&str>, props: Value) -> ResolvedModule {
    ResolvedModule {
      name: name.to_string(),
      inherits: inherits.map(str::to_string),
      properties: props.as_object().cloned().unwrap_or_default(),
      ..Default::default()
    }
  }

  #[test]
  fn build_directory_defaults_to_product_name() {
    let product = ResolvedProduct {
      name: "app".to_string(),
      ..Default::default()
    };
    let ctx = ProductContext::from_resolved("proj", &product, Path::new("/build"));
    assert_eq!(ctx.build_directory, PathBuf::from("/build/app"));
    assert_eq!(ctx.project, "proj");
  }

  #[test]
  fn module_property_inherits_from_base() {
    let ctx = ProductContext {
      modules: vec![
        module("cpp", None, json!({ "optimization": "fast", "warnings": "all" })),
        module("gcc", Some("cpp"), json!({ "optimization": "small" })),
      ],
      ..Default::default()
    };

    assert_eq!(ctx.module_property("gcc", "optimization"), Some(json!("small")));
    assert_eq!(ctx.module_property("gcc", "warnings"), Some(json!("all")));
    assert_eq!(ctx.module_property("gcc", "missing"), Some(Value::Null));
    assert_eq!(ctx.module_property("qt", "version"), None);
  }

  #[test]
  fn inheritance_cycle_terminates() {
    let ctx = ProductContext {
      modules: vec![module("a", Some("b"), json!({})), module("b", Some("a"), json!({}))],
      ..Default::default()
    };
    assert_eq!(ctx.module_property("a", "x"), Some(Value::Null));
  }

  #[test]
  fn parameters_keyed_by_dependency() {
    let mut ctx = ProductContext::default();
    ctx.dependencies.insert("zlib".to_string());
    ctx
      .module_parameters
      .insert("zlib".to_string(), json!({ "static": true }).as_object().cloned().unwrap());

    assert_eq!(ctx.parameter("zlib", "static"), Some(json!(true)));
    assert_eq!(ctx.parameter("zlib", "shared"), Some(Value::Null));
    assert_eq!(ctx.parameter("openssl", "static"), None);
  }
}
