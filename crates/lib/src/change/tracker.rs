//! Decides whether a persisted transformer must re-run after a re-resolve.
//!
//! Each check compares what a script recorded reading against the current
//! model. Anything that can no longer be found counts as changed.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::command::Command;
use crate::file::FileTime;
use crate::graph::{BuildGraph, ProductContext, Transformer};
use crate::resolved::PropertyMap;

use super::{Property, PropertyKind, PropertyReads};

/// Outcome of checking one transformer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decision {
  pub commands_need_rerun: bool,
  pub prepare_needs_rerun: bool,
  pub environment_changed: bool,
}

impl Decision {
  pub fn any(&self) -> bool {
    self.commands_need_rerun || self.prepare_needs_rerun || self.environment_changed
  }
}

pub struct ChangeTracker<'a> {
  products: &'a BTreeMap<String, ProductContext>,
  projects: &'a BTreeMap<String, PropertyMap>,
  last_resolve_time: Option<FileTime>,
  old_environment: &'a BTreeMap<String, String>,
  new_environment: &'a BTreeMap<String, String>,
}

impl<'a> ChangeTracker<'a> {
  pub fn new(
    products: &'a BTreeMap<String, ProductContext>,
    projects: &'a BTreeMap<String, PropertyMap>,
    last_resolve_time: Option<FileTime>,
    old_environment: &'a BTreeMap<String, String>,
    new_environment: &'a BTreeMap<String, String>,
  ) -> Self {
    Self {
      products,
      projects,
      last_resolve_time,
      old_environment,
      new_environment,
    }
  }

  /// Runs all three checks and applies command invalidation to `transformer`.
  pub fn apply(&self, graph: &BuildGraph, transformer: &mut Transformer) -> Decision {
    let decision = self.evaluate(graph, transformer);
    if decision.commands_need_rerun || decision.environment_changed {
      transformer.invalidate_commands();
    }
    decision
  }

  pub fn evaluate(&self, graph: &BuildGraph, transformer: &Transformer) -> Decision {
    Decision {
      commands_need_rerun: self.commands_need_rerun(graph, transformer),
      prepare_needs_rerun: self.prepare_script_needs_rerun(graph, transformer),
      environment_changed: self.environment_change_found(&transformer.commands),
    }
  }

  pub fn commands_need_rerun(&self, graph: &BuildGraph, transformer: &Transformer) -> bool {
    let changed = self.reads_changed(graph, &transformer.product, &transformer.reads_in_commands);
    if changed {
      debug!(transformer = %transformer.id, rule = %transformer.rule, "commands need to re-run");
    }
    changed
  }

  pub fn prepare_script_needs_rerun(&self, graph: &BuildGraph, transformer: &Transformer) -> bool {
    let changed = self.reads_changed(graph, &transformer.product, &transformer.reads_in_prepare);
    if changed {
      debug!(transformer = %transformer.id, rule = %transformer.rule, "prepare script needs to re-run");
    }
    changed
  }

  /// True if a variable some process command declared relevant changed value.
  pub fn environment_change_found(&self, commands: &[Command]) -> bool {
    commands
      .iter()
      .filter_map(Command::relevant_environment_variables)
      .flatten()
      .any(|var| {
        let changed = self.old_environment.get(var) != self.new_environment.get(var);
        if changed {
          debug!(variable = %var, "relevant environment variable changed");
        }
        changed
      })
  }

  fn reads_changed(&self, graph: &BuildGraph, product: &str, reads: &PropertyReads) -> bool {
    for property in &reads.properties {
      if self.property_changed(property) {
        return true;
      }
    }

    for (path, properties) in &reads.artifact_properties {
      if self.artifact_properties_changed(graph, path, properties.iter()) {
        return true;
      }
    }

    for file in &reads.imported_files {
      if self.imported_file_changed(file) {
        return true;
      }
    }

    if let Some(recorded) = &reads.dependencies {
      match self.products.get(product) {
        Some(ctx) if &ctx.dependencies == recorded => {}
        Some(_) => {
          debug!(product = %product, "dependency set changed");
          return true;
        }
        None => return true,
      }
    }

    false
  }

  fn property_changed(&self, property: &Property) -> bool {
    match self.current_value(property) {
      Some(current) if current == property.value => false,
      Some(current) => {
        debug!(property = %property, old = %property.value, new = %current, "property changed");
        true
      }
      None => {
        debug!(property = %property, "property owner no longer exists");
        true
      }
    }
  }

  fn artifact_properties_changed<'p>(
    &self,
    graph: &BuildGraph,
    path: &Path,
    mut properties: impl Iterator<Item = &'p Property>,
  ) -> bool {
    let Some(artifact) = graph.artifact_by_path(path).and_then(|id| graph.artifact(id)) else {
      debug!(artifact = %path.display(), "artifact no longer exists");
      return true;
    };
    properties.any(|p| {
      let changed = artifact.property(&p.module_name, &p.property_name) != p.value;
      if changed {
        debug!(artifact = %path.display(), property = %p, "artifact property changed");
      }
      changed
    })
  }

  fn imported_file_changed(&self, file: &Path) -> bool {
    let changed = match (FileTime::of(file), self.last_resolve_time) {
      (Some(modified), Some(resolved)) => modified > resolved,
      _ => true,
    };
    if changed {
      debug!(file = %file.display(), "imported file changed");
    }
    changed
  }

  /// Current value of a recorded property; `None` if its owner is gone.
  fn current_value(&self, property: &Property) -> Option<Value> {
    match property.kind {
      PropertyKind::Project => {
        let props = self.projects.get(&property.product_name)?;
        Some(props.get(&property.property_name).cloned().unwrap_or(Value::Null))
      }
      PropertyKind::Product => {
        let ctx = self.products.get(&property.product_name)?;
        Some(ctx.product_property(&property.property_name))
      }
      PropertyKind::Module => {
        let ctx = self.products.get(&property.product_name)?;
        ctx.module_property(&property.module_name, &property.property_name)
      }
      PropertyKind::Parameters => {
        let ctx = self.products.get(&property.product_name)?;
        ctx.parameter(&property.module_name, &property.property_name)
      }
      // Artifact reads are keyed by path and checked against the graph.
      PropertyKind::Artifact => None,
    }
  }
}
