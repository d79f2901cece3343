//! Firing rules over the artifacts of one product.
//!
//! Each firing either rescues the transformer a previous resolve created
//! for the same inputs (or the same outputs) or creates a new one. The
//! prepare script only runs when something it depends on changed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::change::{RequestedArtifacts, RequestedDependencies};
use crate::graph::{Artifact, ArtifactId, BuildGraph, NewArtifact, NewTransformer, ProductContext, TransformerId};
use crate::resolve::ResolveError;
use crate::resolved::{PropertyMap, Rule};
use crate::script::{
  ArtifactView, ArtifactViewsByTag, OutputArtifactSpec, PropertyRecorder, Recorded, ScriptEngine, ScriptScope,
};
use crate::util::hash::ContentHash;

use super::template::{self, InputField, ProductField};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
  /// Transformers created from scratch.
  pub created: usize,
  /// Existing transformers kept, with or without re-running prepare.
  pub rescued: usize,
  /// Prepare scripts evaluated.
  pub prepared: usize,
}

/// What rule application left behind for one product.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
  pub visited_transformers: BTreeSet<TransformerId>,
  pub visited_artifacts: BTreeSet<ArtifactId>,
  pub requested_artifacts: RequestedArtifacts,
  pub requested_dependencies: RequestedDependencies,
  pub stats: ApplyStats,
}

/// Applies the rules of one product to the graph.
pub struct RuleApplicator<'a> {
  graph: &'a mut BuildGraph,
  engine: &'a dyn ScriptEngine,
  product: Arc<ProductContext>,
  project_properties: Arc<PropertyMap>,
  /// Transformers whose prepare step must re-run regardless of their inputs.
  prepare_needed: &'a BTreeSet<TransformerId>,
  force_prepare: bool,
  outcome: ApplyOutcome,
}

struct Selection {
  inputs: Vec<ArtifactId>,
  explicit: BTreeSet<ArtifactId>,
  auxiliary: BTreeSet<ArtifactId>,
}

impl<'a> RuleApplicator<'a> {
  pub fn new(
    graph: &'a mut BuildGraph,
    engine: &'a dyn ScriptEngine,
    product: Arc<ProductContext>,
    prepare_needed: &'a BTreeSet<TransformerId>,
    force_prepare: bool,
  ) -> Self {
    let project_properties = Arc::new(graph.project_properties(&product.project).cloned().unwrap_or_default());
    let mut outcome = ApplyOutcome::default();
    // A stale ledger is rebuilt from scratch by the prepare runs that follow.
    if !force_prepare && let Some(data) = graph.product(&product.name) {
      outcome.requested_artifacts = data.requested_artifacts.clone();
      outcome.requested_dependencies = data.requested_dependencies.clone();
    }
    Self {
      graph,
      engine,
      product,
      project_properties,
      prepare_needed,
      force_prepare,
      outcome,
    }
  }

  pub fn finish(self) -> ApplyOutcome {
    self.outcome
  }

  /// Fires `rule` for every input group it matches.
  pub fn apply(&mut self, rule: &Rule) -> Result<(), ResolveError> {
    let selection = self.select(rule);
    let groups: Vec<Vec<ArtifactId>> = if selection.inputs.is_empty() {
      if rule.requires_inputs { Vec::new() } else { vec![Vec::new()] }
    } else if rule.multiplex {
      vec![selection.inputs.clone()]
    } else {
      selection.inputs.iter().map(|&id| vec![id]).collect()
    };

    debug!(
      product = %self.product.name,
      rule = %rule.name,
      inputs = selection.inputs.len(),
      groups = groups.len(),
      "applying rule"
    );

    let fingerprint = rule
      .fingerprint()
      .map_err(|e| ResolveError::Internal(format!("cannot fingerprint rule '{}': {e}", rule.name)))?;
    let product_views = Arc::new(self.product_artifact_views());
    for group in groups {
      self.apply_group(rule, &fingerprint, &group, &selection, product_views.clone())?;
    }
    Ok(())
  }

  fn select(&self, rule: &Rule) -> Selection {
    let name = &self.product.name;
    let mut inputs: Vec<ArtifactId> = self
      .graph
      .artifacts_by_file_tags(name, &rule.inputs)
      .into_iter()
      .filter(|id| {
        self
          .graph
          .artifact(*id)
          .is_some_and(|a| !a.has_any_tag(&rule.excluded_inputs))
      })
      .collect();
    inputs.extend(self.from_dependencies(&rule.inputs_from_dependencies));
    let inputs = self.sort_unique(inputs);

    let mut explicit: BTreeSet<ArtifactId> = self
      .graph
      .artifacts_by_file_tags(name, &rule.explicitly_depends_on)
      .into_iter()
      .collect();
    explicit.extend(self.from_dependencies(&rule.explicitly_depends_on_from_dependencies));

    let auxiliary = self
      .graph
      .artifacts_by_file_tags(name, &rule.auxiliary_inputs)
      .into_iter()
      .collect();

    Selection {
      inputs,
      explicit,
      auxiliary,
    }
  }

  /// Target artifacts of dependency products carrying any of `tags`.
  fn from_dependencies(&self, tags: &BTreeSet<crate::resolved::FileTag>) -> Vec<ArtifactId> {
    if tags.is_empty() {
      return Vec::new();
    }
    self
      .product
      .dependencies
      .iter()
      .flat_map(|dep| self.graph.target_artifacts(dep))
      .filter(|id| self.graph.artifact(*id).is_some_and(|a| a.has_any_tag(tags)))
      .collect()
  }

  fn sort_unique(&self, ids: Vec<ArtifactId>) -> Vec<ArtifactId> {
    let mut with_paths: Vec<(&Path, ArtifactId)> = ids
      .into_iter()
      .filter_map(|id| self.graph.artifact(id).map(|a| (a.path(), id)))
      .collect();
    with_paths.sort();
    with_paths.dedup();
    with_paths.into_iter().map(|(_, id)| id).collect()
  }

  fn apply_group(
    &mut self,
    rule: &Rule,
    fingerprint: &ContentHash,
    group: &[ArtifactId],
    selection: &Selection,
    product_views: Arc<ArtifactViewsByTag>,
  ) -> Result<(), ResolveError> {
    let inputs: BTreeSet<ArtifactId> = group.iter().copied().collect();
    let key_inputs = self.graph.sorted_paths(&inputs);

    let output_recorder = Arc::new(PropertyRecorder::new());
    let output_scope = self.scope(
      &inputs,
      &BTreeSet::new(),
      &selection.explicit,
      &selection.auxiliary,
      product_views.clone(),
    );
    let specs = self.output_specs(rule, group, &output_scope, output_recorder.clone())?;
    if specs.is_empty() && !inputs.is_empty() && !rule.allow_empty_outputs {
      return Err(ResolveError::NoOutputs {
        product: self.product.name.clone(),
        rule: rule.name.clone(),
        location: rule.location.clone(),
      });
    }

    let mut outputs = BTreeSet::new();
    for spec in &specs {
      outputs.insert(self.ensure_output(rule, spec)?);
    }

    let existing = self
      .graph
      .find_transformer(&self.product.name, &rule.name, &key_inputs)
      .filter(|id| !self.outcome.visited_transformers.contains(id));
    let target = existing.or_else(|| self.takeover_candidate(rule, &outputs));

    let (id, rewired) = match target {
      Some(id) => {
        let changed = self.rewire(id, rule, &inputs, &selection.explicit, &selection.auxiliary, &outputs)?;
        self.outcome.stats.rescued += 1;
        (id, changed)
      }
      None => {
        for &output in &outputs {
          self.release_output(rule, output, None)?;
        }
        let id = self.graph.add_transformer(NewTransformer {
          product: self.product.name.clone(),
          rule: rule.name.clone(),
          inputs: inputs.clone(),
          explicit_dependencies: selection.explicit.clone(),
          auxiliary_inputs: selection.auxiliary.clone(),
          outputs: outputs.clone(),
          always_run: rule.always_run,
          ..Default::default()
        })?;
        self.outcome.stats.created += 1;
        info!(product = %self.product.name, rule = %rule.name, transformer = %id, "created transformer");
        (id, true)
      }
    };

    self.outcome.visited_transformers.insert(id);
    self.outcome.visited_artifacts.extend(outputs.iter().copied());

    let rule_changed = self
      .graph
      .transformer(id)
      .is_some_and(|t| t.rule_fingerprint.as_ref() != Some(fingerprint));
    if rule_changed && !rewired {
      debug!(transformer = %id, rule = %rule.name, "rule definition changed");
    }
    let prepare = rewired || rule_changed || self.force_prepare || self.prepare_needed.contains(&id);
    let output_reads = output_recorder.take();
    if !prepare {
      self.absorb_ledgers(&output_reads);
      if let Some(t) = self.graph.transformer_mut(id) {
        t.always_run = rule.always_run;
      }
      return Ok(());
    }

    let scope = self.scope(
      &inputs,
      &outputs,
      &selection.explicit,
      &selection.auxiliary,
      product_views,
    );
    let recorder = Arc::new(PropertyRecorder::new());
    let commands = self
      .engine
      .prepare(&rule.prepare, &scope, recorder.clone())
      .map_err(|source| ResolveError::Prepare {
        product: self.product.name.clone(),
        rule: rule.name.clone(),
        source,
      })?;
    let prepare_reads = recorder.take();
    self.absorb_ledgers(&output_reads);
    self.absorb_ledgers(&prepare_reads);
    self.outcome.stats.prepared += 1;

    let t = self
      .graph
      .transformer_mut(id)
      .ok_or_else(|| ResolveError::Internal(format!("transformer {id} vanished during rule application")))?;
    let mut reads_in_commands = prepare_reads.reads.clone();
    if t.commands != commands {
      debug!(transformer = %id, rule = %rule.name, "command list changed");
      t.needs_rerun = true;
    } else if !t.needs_rerun {
      // Reads recorded by script commands at build time stay valid.
      reads_in_commands.merge(std::mem::take(&mut t.reads_in_commands));
    }
    t.commands = commands;
    t.always_run = rule.always_run;
    t.rule_fingerprint = Some(fingerprint.clone());
    t.reads_in_commands = reads_in_commands;
    let mut reads = output_reads.reads;
    reads.merge(prepare_reads.reads);
    t.reads_in_prepare = reads;
    Ok(())
  }

  fn absorb_ledgers(&mut self, recorded: &Recorded) {
    self
      .outcome
      .requested_artifacts
      .merge(recorded.requested_artifacts.clone());
    self
      .outcome
      .requested_dependencies
      .merge(recorded.requested_dependencies.clone());
  }

  fn output_specs(
    &self,
    rule: &Rule,
    group: &[ArtifactId],
    scope: &ScriptScope,
    recorder: Arc<PropertyRecorder>,
  ) -> Result<Vec<OutputArtifactSpec>, ResolveError> {
    let single_input = match group {
      [only] => self.graph.artifact(*only),
      _ => None,
    };
    let context = TemplateContext {
      input: single_input,
      product: &self.product,
    };

    let mut specs = Vec::new();
    for declared in &rule.artifacts {
      let path = template::substitute(&declared.file_path, &context).map_err(|source| ResolveError::Template {
        rule: rule.name.clone(),
        location: rule.location.clone(),
        source,
      })?;
      specs.push(OutputArtifactSpec {
        file_path: PathBuf::from(path),
        file_tags: declared.file_tags.clone(),
        always_updated: declared.always_updated,
        properties: declared.properties.clone(),
        install: declared.install.clone(),
      });
    }

    if let Some(script) = &rule.output_artifacts {
      let dynamic = self
        .engine
        .output_artifacts(script, scope, recorder)
        .map_err(|source| ResolveError::Prepare {
          product: self.product.name.clone(),
          rule: rule.name.clone(),
          source,
        })?;
      for mut spec in dynamic {
        if spec.file_tags.is_empty() {
          spec.file_tags = rule.output_file_tags.clone();
        }
        if let Some(tag) = spec.file_tags.iter().find(|tag| !rule.output_file_tags.contains(*tag)) {
          return Err(ResolveError::UndeclaredOutputTag {
            product: self.product.name.clone(),
            rule: rule.name.clone(),
            tag: tag.clone(),
            location: rule.location.clone(),
          });
        }
        specs.push(spec);
      }
    }

    Ok(specs)
  }

  /// Finds or creates the artifact for a declared output.
  fn ensure_output(&mut self, rule: &Rule, spec: &OutputArtifactSpec) -> Result<ArtifactId, ResolveError> {
    let path = if spec.file_path.is_absolute() {
      spec.file_path.clone()
    } else {
      self.product.build_directory.join(&spec.file_path)
    };

    if let Some(id) = self.graph.artifact_by_path(&path) {
      let artifact = self
        .graph
        .artifact_mut(id)
        .ok_or_else(|| ResolveError::Internal(format!("stale path index for {}", path.display())))?;
      if !artifact.is_generated() || artifact.product != self.product.name {
        let first = if artifact.is_generated() {
          format!("product {}", artifact.product)
        } else {
          "a source artifact".to_string()
        };
        return Err(ResolveError::DuplicateOutput {
          path,
          first,
          second: rule.name.clone(),
        });
      }
      artifact.file_tags = spec.file_tags.clone();
      artifact.properties = spec.properties.clone();
      artifact.always_updated = spec.always_updated;
      artifact.install = spec.install.clone();
      return Ok(id);
    }

    let mut new = NewArtifact::generated(self.product.name.as_str(), &path, spec.file_tags.clone());
    new.properties = spec.properties.clone();
    new.always_updated = spec.always_updated;
    new.install = spec.install.clone();
    let id = self.graph.add_artifact(new)?;
    debug!(artifact = %path.display(), rule = %rule.name, "created output artifact");
    Ok(id)
  }

  /// An unvisited transformer of the same rule that already produces one of `outputs`.
  fn takeover_candidate(&self, rule: &Rule, outputs: &BTreeSet<ArtifactId>) -> Option<TransformerId> {
    outputs
      .iter()
      .filter_map(|id| self.graph.artifact(*id)?.producer)
      .find(|producer| self.is_reclaimable(rule, *producer))
  }

  fn is_reclaimable(&self, rule: &Rule, transformer: TransformerId) -> bool {
    !self.outcome.visited_transformers.contains(&transformer)
      && self
        .graph
        .transformer(transformer)
        .is_some_and(|t| t.product == self.product.name && t.rule == rule.name)
  }

  /// Frees `artifact` for `owner`. Fails if a transformer this resolve already kept produces it.
  fn release_output(
    &mut self,
    rule: &Rule,
    artifact: ArtifactId,
    owner: Option<TransformerId>,
  ) -> Result<(), ResolveError> {
    let Some(a) = self.graph.artifact(artifact) else {
      return Err(ResolveError::Internal(format!("unknown output artifact {artifact}")));
    };
    match a.producer {
      None => Ok(()),
      Some(producer) if Some(producer) == owner => Ok(()),
      Some(producer) if self.is_reclaimable(rule, producer) => {
        self.graph.detach_output(producer, artifact);
        Ok(())
      }
      Some(producer) => Err(ResolveError::DuplicateOutput {
        path: a.path().to_path_buf(),
        first: self.graph.transformer_label(producer),
        second: rule.name.clone(),
      }),
    }
  }

  /// Points an existing transformer at new edges. Returns true if any edge changed.
  fn rewire(
    &mut self,
    id: TransformerId,
    rule: &Rule,
    inputs: &BTreeSet<ArtifactId>,
    explicit: &BTreeSet<ArtifactId>,
    auxiliary: &BTreeSet<ArtifactId>,
    outputs: &BTreeSet<ArtifactId>,
  ) -> Result<bool, ResolveError> {
    let t = self
      .graph
      .transformer(id)
      .ok_or_else(|| ResolveError::Internal(format!("unknown transformer {id}")))?;
    let changed =
      t.inputs != *inputs || t.explicit_dependencies != *explicit || t.auxiliary_inputs != *auxiliary || t.outputs != *outputs;
    let dropped: Vec<ArtifactId> = t.outputs.difference(outputs).copied().collect();

    for output in dropped {
      self.graph.detach_output(id, output);
    }
    for &output in outputs {
      self.release_output(rule, output, Some(id))?;
      self.graph.attach_output(id, output)?;
    }
    self
      .graph
      .set_transformer_inputs(id, inputs.clone(), explicit.clone(), auxiliary.clone())?;

    if changed {
      debug!(transformer = %id, rule = %rule.name, "transformer edges changed");
    }
    Ok(changed)
  }

  fn views(&self, ids: &BTreeSet<ArtifactId>) -> Vec<ArtifactView> {
    let mut views: Vec<ArtifactView> = ids
      .iter()
      .filter_map(|id| self.graph.artifact(*id))
      .map(ArtifactView::from_artifact)
      .collect();
    views.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    views
  }

  fn scope(
    &self,
    inputs: &BTreeSet<ArtifactId>,
    outputs: &BTreeSet<ArtifactId>,
    explicit: &BTreeSet<ArtifactId>,
    auxiliary: &BTreeSet<ArtifactId>,
    product_artifacts: Arc<ArtifactViewsByTag>,
  ) -> ScriptScope {
    ScriptScope {
      product: self.product.clone(),
      project_properties: self.project_properties.clone(),
      product_artifacts,
      inputs: self.views(inputs),
      outputs: self.views(outputs),
      explicitly_depends_on: self.views(explicit),
      auxiliary_inputs: self.views(auxiliary),
    }
  }

  fn product_artifact_views(&self) -> ArtifactViewsByTag {
    let mut by_tag = ArtifactViewsByTag::new();
    let Some(data) = self.graph.product(&self.product.name) else {
      return by_tag;
    };
    for artifact in data.artifacts.iter().filter_map(|id| self.graph.artifact(*id)) {
      let view = ArtifactView::from_artifact(artifact);
      for tag in &artifact.file_tags {
        by_tag.entry(tag.clone()).or_default().push(view.clone());
      }
    }
    for views in by_tag.values_mut() {
      views.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    }
    by_tag
  }
}

struct TemplateContext<'a> {
  input: Option<&'a Artifact>,
  product: &'a ProductContext,
}

impl template::Resolver for TemplateContext<'_> {
  fn resolve_input(&self, field: InputField) -> Option<String> {
    let file = &self.input?.file;
    Some(match field {
      InputField::FileName => file.file_name().to_string(),
      InputField::BaseName => file.base_name().to_string(),
      InputField::CompleteBaseName => file.complete_base_name().to_string(),
      InputField::Suffix => file.suffix().to_string(),
      InputField::Dir => file.dir_path().to_string_lossy().into_owned(),
    })
  }

  fn resolve_product(&self, field: ProductField) -> String {
    match field {
      ProductField::Name => self.product.name.clone(),
      ProductField::BuildDirectory => self.product.build_directory.to_string_lossy().into_owned(),
    }
  }
}
