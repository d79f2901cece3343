//! The scripting collaborator.
//!
//! Rules build their commands by running scripts against views of the
//! product, its project and the matched artifacts. Every property a script
//! reads is reported to a [`PropertyObserver`], which is what lets the
//! change tracker invalidate transformers precisely.

mod lua;
mod observer;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::command::{Command, ScriptCommand};
use crate::graph::{Artifact, ProductContext};
use crate::resolved::{CodeLocation, FileTag, InstallSpec, PropertyMap, Script};

pub use lua::LuaScriptEngine;
pub use observer::{NullObserver, PropertyObserver, PropertyRecorder, Recorded};

/// A process environment: variable name to value.
pub type Environment = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ScriptError {
  #[error("{location}: {message}")]
  Evaluation { location: CodeLocation, message: String },

  #[error("{location}: invalid script result: {message}")]
  InvalidResult { location: CodeLocation, message: String },

  #[error("cannot read imported file {}: {source}", path.display())]
  Import {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// What a rule script sees of one artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactView {
  pub file_path: PathBuf,
  pub file_name: String,
  pub base_name: String,
  pub complete_base_name: String,
  pub suffix: String,
  pub file_dir: PathBuf,
  pub file_tags: BTreeSet<FileTag>,
  pub product: String,
  pub properties: PropertyMap,
}

impl ArtifactView {
  pub fn from_artifact(artifact: &Artifact) -> Self {
    let file = &artifact.file;
    Self {
      file_path: file.file_path().to_path_buf(),
      file_name: file.file_name().to_string(),
      base_name: file.base_name().to_string(),
      complete_base_name: file.complete_base_name().to_string(),
      suffix: file.suffix().to_string(),
      file_dir: file.dir_path().to_path_buf(),
      file_tags: artifact.file_tags.clone(),
      product: artifact.product.clone(),
      properties: artifact.properties.clone(),
    }
  }

  pub fn property(&self, module: &str, name: &str) -> Value {
    let found = if module.is_empty() {
      self.properties.get(name)
    } else {
      self.properties.get(module).and_then(|m| m.get(name))
    };
    found.cloned().unwrap_or(Value::Null)
  }
}

/// Artifact views of a product grouped by tag.
pub type ArtifactViewsByTag = BTreeMap<FileTag, Vec<ArtifactView>>;

/// Everything a prepare script, output artifacts script or script command can see.
#[derive(Debug, Clone, Default)]
pub struct ScriptScope {
  pub product: Arc<ProductContext>,
  pub project_properties: Arc<PropertyMap>,
  pub product_artifacts: Arc<ArtifactViewsByTag>,
  pub inputs: Vec<ArtifactView>,
  pub outputs: Vec<ArtifactView>,
  pub explicitly_depends_on: Vec<ArtifactView>,
  pub auxiliary_inputs: Vec<ArtifactView>,
}

/// What an environment setup script sees.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentScope {
  pub product: Arc<ProductContext>,
  pub module: String,
}

/// An output declared by an output artifacts script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputArtifactSpec {
  pub file_path: PathBuf,
  pub file_tags: BTreeSet<FileTag>,
  pub always_updated: bool,
  pub properties: PropertyMap,
  pub install: Option<InstallSpec>,
}

/// Evaluates rule, environment and command scripts.
///
/// Implementations must report property reads to the observer they are
/// handed; the change tracker is only as precise as those reports.
pub trait ScriptEngine: Send + Sync {
  /// Runs a rule's prepare script and returns its command list.
  fn prepare(
    &self,
    script: &Script,
    scope: &ScriptScope,
    observer: Arc<dyn PropertyObserver>,
  ) -> Result<Vec<Command>, ScriptError>;

  /// Runs a rule's output artifacts script.
  fn output_artifacts(
    &self,
    script: &Script,
    scope: &ScriptScope,
    observer: Arc<dyn PropertyObserver>,
  ) -> Result<Vec<OutputArtifactSpec>, ScriptError>;

  /// Runs a module's environment setup script, mutating `environment` in place.
  fn setup_environment(
    &self,
    script: &Script,
    scope: &EnvironmentScope,
    environment: &mut Environment,
  ) -> Result<(), ScriptError>;

  /// Executes a script command.
  fn run_command(
    &self,
    command: &ScriptCommand,
    scope: &ScriptScope,
    observer: Arc<dyn PropertyObserver>,
  ) -> Result<(), ScriptError>;

  /// Applies an output filter function to captured process output.
  fn filter_output(&self, filter: &Script, output: &str) -> Result<String, ScriptError>;
}
