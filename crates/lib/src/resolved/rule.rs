use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::util::hash::{ContentHash, hash_bytes};

use super::{CodeLocation, FileTag, InstallSpec, PropertyMap, Script, default_true};

/// A declarative mapping from input file tags to output artifacts plus a prepare script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
  pub name: String,
  #[serde(default)]
  pub inputs: BTreeSet<FileTag>,
  /// Tags matched against the target artifacts of dependency products.
  #[serde(default)]
  pub inputs_from_dependencies: BTreeSet<FileTag>,
  #[serde(default)]
  pub excluded_inputs: BTreeSet<FileTag>,
  #[serde(default)]
  pub explicitly_depends_on: BTreeSet<FileTag>,
  #[serde(default)]
  pub explicitly_depends_on_from_dependencies: BTreeSet<FileTag>,
  /// Visible to scripts, never creates graph edges.
  #[serde(default)]
  pub auxiliary_inputs: BTreeSet<FileTag>,
  /// One transformer for the whole input collection instead of one per input.
  #[serde(default)]
  pub multiplex: bool,
  #[serde(default = "default_true")]
  pub requires_inputs: bool,
  #[serde(default)]
  pub always_run: bool,
  #[serde(default)]
  pub allow_empty_outputs: bool,
  /// Tags the output artifacts script may produce.
  #[serde(default)]
  pub output_file_tags: BTreeSet<FileTag>,
  #[serde(default)]
  pub artifacts: Vec<ArtifactTemplate>,
  #[serde(default)]
  pub output_artifacts: Option<Script>,
  pub prepare: Script,
  #[serde(default)]
  pub location: CodeLocation,
}

impl Rule {
  /// Tags whose producers must run before this rule is applied.
  pub fn consumed_tags(&self) -> BTreeSet<FileTag> {
    self
      .inputs
      .iter()
      .chain(&self.explicitly_depends_on)
      .chain(&self.auxiliary_inputs)
      .cloned()
      .collect()
  }

  /// Digest of everything that shapes the commands. Source locations are left out.
  pub fn fingerprint(&self) -> Result<ContentHash, serde_json::Error> {
    let mut definition = Rule {
      location: CodeLocation::default(),
      ..self.clone()
    };
    definition.prepare.location = CodeLocation::default();
    if let Some(script) = &mut definition.output_artifacts {
      script.location = CodeLocation::default();
    }
    Ok(hash_bytes(&serde_json::to_vec(&definition)?))
  }

  /// Tags this rule can attach to its outputs.
  pub fn produced_tags(&self) -> BTreeSet<FileTag> {
    let mut tags = self.output_file_tags.clone();
    for template in &self.artifacts {
      tags.extend(template.file_tags.iter().cloned());
    }
    tags
  }
}

/// A declared output: its path may reference the input and product through placeholders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactTemplate {
  pub file_path: String,
  #[serde(default)]
  pub file_tags: BTreeSet<FileTag>,
  #[serde(default = "default_true")]
  pub always_updated: bool,
  #[serde(default)]
  pub properties: PropertyMap,
  #[serde(default)]
  pub install: Option<InstallSpec>,
}

impl ArtifactTemplate {
  pub fn new(file_path: impl Into<String>, file_tags: BTreeSet<FileTag>) -> Self {
    Self {
      file_path: file_path.into(),
      file_tags,
      always_updated: true,
      ..Default::default()
    }
  }
}
