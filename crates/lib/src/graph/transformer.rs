use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::change::PropertyReads;
use crate::command::Command;
use crate::util::hash::ContentHash;

use super::ArtifactId;

/// Stable handle of a transformer in the build graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformerId(pub u32);

impl fmt::Display for TransformerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "t{}", self.0)
  }
}

/// The unit of build work: inputs, outputs and an ordered command list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformer {
  pub id: TransformerId,
  pub product: String,
  pub rule: String,
  /// Sorted input paths at creation, used to find this transformer again on re-resolve.
  pub key_inputs: Vec<PathBuf>,
  pub inputs: BTreeSet<ArtifactId>,
  #[serde(default)]
  pub explicit_dependencies: BTreeSet<ArtifactId>,
  #[serde(default)]
  pub auxiliary_inputs: BTreeSet<ArtifactId>,
  pub outputs: BTreeSet<ArtifactId>,
  pub commands: Vec<Command>,
  #[serde(default)]
  pub reads_in_commands: PropertyReads,
  #[serde(default)]
  pub reads_in_prepare: PropertyReads,
  #[serde(default)]
  pub always_run: bool,
  #[serde(default)]
  pub needs_rerun: bool,
  /// Digest of the rule definition the commands were prepared from.
  #[serde(default)]
  pub rule_fingerprint: Option<ContentHash>,
}

impl Transformer {
  pub(super) fn from_new(id: TransformerId, key_inputs: Vec<PathBuf>, new: NewTransformer) -> Self {
    Self {
      id,
      product: new.product,
      rule: new.rule,
      key_inputs,
      inputs: new.inputs,
      explicit_dependencies: new.explicit_dependencies,
      auxiliary_inputs: new.auxiliary_inputs,
      outputs: new.outputs,
      commands: new.commands,
      reads_in_commands: PropertyReads::default(),
      reads_in_prepare: new.reads_in_prepare,
      always_run: new.always_run,
      needs_rerun: true,
      rule_fingerprint: None,
    }
  }

  /// Artifacts whose producers must finish first. Auxiliary inputs are not edges.
  pub fn dependencies(&self) -> impl Iterator<Item = ArtifactId> + '_ {
    self.inputs.iter().chain(&self.explicit_dependencies).copied()
  }

  /// Marks the command results as unusable so the transformer runs again.
  pub fn invalidate_commands(&mut self) {
    self.needs_rerun = true;
    self.reads_in_commands = PropertyReads::default();
  }

  pub fn command_descriptions(&self) -> Vec<String> {
    self.commands.iter().map(Command::describe).collect()
  }
}

#[derive(Debug, Clone, Default)]
pub struct NewTransformer {
  pub product: String,
  pub rule: String,
  pub inputs: BTreeSet<ArtifactId>,
  pub explicit_dependencies: BTreeSet<ArtifactId>,
  pub auxiliary_inputs: BTreeSet<ArtifactId>,
  pub outputs: BTreeSet<ArtifactId>,
  pub commands: Vec<Command>,
  pub reads_in_prepare: PropertyReads,
  pub always_run: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::command::ProcessCommand;

  #[test]
  fn new_transformer_needs_rerun() {
    let t = Transformer::from_new(
      TransformerId(1),
      Vec::new(),
      NewTransformer {
        product: "app".to_string(),
        rule: "compiler".to_string(),
        inputs: [ArtifactId(0)].into(),
        explicit_dependencies: [ArtifactId(5)].into(),
        auxiliary_inputs: [ArtifactId(6)].into(),
        outputs: [ArtifactId(1)].into(),
        commands: vec![Command::Process(ProcessCommand::new("cc").description("compiling a.c"))],
        ..Default::default()
      },
    );

    assert!(t.needs_rerun);
    assert_eq!(t.dependencies().collect::<Vec<_>>(), vec![ArtifactId(0), ArtifactId(5)]);
    assert_eq!(t.command_descriptions(), vec!["compiling a.c".to_string()]);
  }

  #[test]
  fn invalidate_commands_clears_reads() {
    let mut t = Transformer::from_new(TransformerId(0), Vec::new(), NewTransformer::default());
    t.needs_rerun = false;
    t.reads_in_commands.imported_files.insert(PathBuf::from("/x.lua"));

    t.invalidate_commands();
    assert!(t.needs_rerun);
    assert!(t.reads_in_commands.is_empty());
  }
}
