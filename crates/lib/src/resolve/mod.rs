//! Resolving a project model into the build graph.
//!
//! A resolve merges a freshly evaluated [`ResolvedProject`] into the graph
//! persisted by the previous run. Unchanged transformers are rescued with
//! their build state; only what the change tracker flags (or what the new
//! model adds) is prepared again.

mod products;
mod sources;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::change::{ChangeTracker, RequestedArtifacts, RequestedDependencies};
use crate::env::{self, EnvironmentError};
use crate::file::FileTime;
use crate::graph::{Artifact, BuildGraph, GraphError, ProductContext, TransformerId};
use crate::resolved::{CodeLocation, FileTag, PropertyMap, ResolvedProduct, ResolvedProject};
use crate::rules::{ApplyOutcome, RuleApplicator, order_rules, template::TemplateError};
use crate::scan::{ScanError, ScanResultCache, Scanner};
use crate::script::{Environment, ScriptEngine, ScriptError};

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("rule '{rule}' in product '{product}' consumes its own output tags")]
  RuleCycle { product: String, rule: String },

  #[error("product dependency cycle involving '{0}'")]
  ProductCycle(String),

  #[error("product '{product}' depends on unknown product '{dependency}'")]
  MissingProductDependency { product: String, dependency: String },

  #[error("artifact {} is produced by both {first} and rule '{second}'", path.display())]
  DuplicateOutput { path: PathBuf, first: String, second: String },

  #[error("source file {} of product '{product}' does not exist", path.display())]
  SourceMissing { product: String, path: PathBuf },

  #[error("prepare script of rule '{rule}' in product '{product}' failed: {source}")]
  Prepare {
    product: String,
    rule: String,
    #[source]
    source: ScriptError,
  },

  #[error("{location}: rule '{rule}' in product '{product}' produced no outputs")]
  NoOutputs {
    product: String,
    rule: String,
    location: CodeLocation,
  },

  #[error("{location}: rule '{rule}' in product '{product}' produced tag '{tag}' missing from its output file tags")]
  UndeclaredOutputTag {
    product: String,
    rule: String,
    tag: FileTag,
    location: CodeLocation,
  },

  #[error("{location}: bad artifact template in rule '{rule}': {source}")]
  Template {
    rule: String,
    location: CodeLocation,
    #[source]
    source: TemplateError,
  },

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Environment(#[from] EnvironmentError),

  #[error(transparent)]
  Scan(#[from] ScanError),

  #[error("internal error: {0}")]
  Internal(String),
}

/// Inputs of a resolve besides the project model itself.
#[derive(Debug, Clone)]
pub struct ResolveConfig {
  pub build_directory: PathBuf,
  /// Re-run every prepare script even if nothing it read changed.
  pub force_prepare: bool,
  /// Environment snapshot compared against the one stored by the last resolve.
  pub environment: Environment,
}

impl ResolveConfig {
  /// A config using the current process environment.
  pub fn new(build_directory: impl Into<PathBuf>) -> Self {
    Self {
      build_directory: build_directory.into(),
      force_prepare: false,
      environment: std::env::vars().collect(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveSummary {
  pub products: usize,
  pub transformers_created: usize,
  pub transformers_rescued: usize,
  pub transformers_removed: usize,
  pub artifacts_removed: usize,
  pub prepare_runs: usize,
  /// Persisted transformers the change tracker flagged.
  pub invalidated: usize,
  /// Products whose resolved context differs from the stored one.
  pub changed_products: BTreeSet<String>,
  /// Generated files dropped from the graph and deleted from disk.
  pub removed_files: Vec<PathBuf>,
}

/// Merges a resolved project into a build graph.
pub struct Resolver<'a> {
  graph: &'a mut BuildGraph,
  engine: &'a dyn ScriptEngine,
  scanners: &'a [Arc<dyn Scanner>],
  scan_cache: &'a ScanResultCache,
  config: &'a ResolveConfig,
}

impl<'a> Resolver<'a> {
  pub fn new(
    graph: &'a mut BuildGraph,
    engine: &'a dyn ScriptEngine,
    scanners: &'a [Arc<dyn Scanner>],
    scan_cache: &'a ScanResultCache,
    config: &'a ResolveConfig,
  ) -> Self {
    Self {
      graph,
      engine,
      scanners,
      scan_cache,
      config,
    }
  }

  /// Resolves `project` into the graph.
  ///
  /// On error the graph may be partially updated; callers that need to keep
  /// the previous state resolve into a copy.
  pub fn resolve(&mut self, project: &ResolvedProject) -> Result<ResolveSummary, ResolveError> {
    let started = Instant::now();
    let resolve_time = FileTime::now();
    info!(project = %project.name, build_dir = %self.config.build_directory.display(), "resolving project");

    self.graph.project = project.name.clone();
    self.graph.build_directory = self.config.build_directory.clone();

    let declared: BTreeMap<&str, (&str, &ResolvedProduct)> = project
      .all_products()
      .into_iter()
      .map(|(project_name, product)| (product.name.as_str(), (project_name, product)))
      .collect();
    let contexts: BTreeMap<String, ProductContext> = declared
      .values()
      .filter(|(_, product)| product.enabled)
      .map(|(project_name, product)| {
        let context = ProductContext::from_resolved(project_name, product, &self.config.build_directory);
        (product.name.clone(), context)
      })
      .collect();
    let projects: BTreeMap<String, PropertyMap> = project
      .all_projects()
      .into_iter()
      .map(|p| (p.name.clone(), p.properties.clone()))
      .collect();

    let mut summary = ResolveSummary {
      products: contexts.len(),
      ..Default::default()
    };

    for context in contexts.values() {
      env::module_order(context)?;
    }
    let order = products::product_order(&declared, &contexts)?;

    self.sync_products(&declared, &contexts, &mut summary)?;
    self.graph.set_project_properties(projects.clone());

    let prepare_needed = self.track_changes(&contexts, &projects, &mut summary);

    for name in &order {
      let (Some((_, product)), Some(context)) = (declared.get(name.as_str()), contexts.get(name)) else {
        return Err(ResolveError::Internal(format!("product {name} vanished during resolve")));
      };
      self.apply_product(product, Arc::new(context.clone()), &prepare_needed, &mut summary)?;
    }

    self.graph.verify_acyclic()?;
    self.graph.check_consistency()?;
    self.graph.environment = self.config.environment.clone();
    self.graph.last_resolve_time = Some(resolve_time);

    remove_files(&summary.removed_files);

    info!(
      project = %project.name,
      products = summary.products,
      created = summary.transformers_created,
      rescued = summary.transformers_rescued,
      removed = summary.transformers_removed,
      prepared = summary.prepare_runs,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "resolve complete"
    );
    Ok(summary)
  }

  /// Drops vanished products and brings product contexts and source artifacts up to date.
  fn sync_products(
    &mut self,
    declared: &BTreeMap<&str, (&str, &ResolvedProduct)>,
    contexts: &BTreeMap<String, ProductContext>,
    summary: &mut ResolveSummary,
  ) -> Result<(), ResolveError> {
    for name in self.graph.product_names() {
      if !contexts.contains_key(&name) {
        info!(product = %name, "product removed");
        summary.removed_files.extend(self.graph.remove_product(&name));
      }
    }

    for (name, context) in contexts {
      if self.graph.product(name).is_none_or(|data| data.context != *context) {
        summary.changed_products.insert(name.clone());
      }
      self.graph.upsert_product(context.clone());
    }

    for (name, (_, product)) in declared {
      if !product.enabled {
        continue;
      }
      sources::sync_sources(self.graph, name, &product.sources)?;
      sources::scan_sources(self.graph, name, self.scanners, self.scan_cache)?;
    }
    Ok(())
  }

  /// Runs the change tracker over every persisted transformer.
  ///
  /// Returns the transformers whose prepare step must run again.
  fn track_changes(
    &mut self,
    contexts: &BTreeMap<String, ProductContext>,
    projects: &BTreeMap<String, PropertyMap>,
    summary: &mut ResolveSummary,
  ) -> BTreeSet<TransformerId> {
    let old_environment = self.graph.environment.clone();
    let tracker = ChangeTracker::new(
      contexts,
      projects,
      self.graph.last_resolve_time,
      &old_environment,
      &self.config.environment,
    );

    let ids: Vec<TransformerId> = self.graph.transformers().map(|t| t.id).collect();
    let mut prepare_needed = BTreeSet::new();
    for id in ids {
      let Some(transformer) = self.graph.transformer(id) else {
        continue;
      };
      let decision = tracker.evaluate(self.graph, transformer);
      if !decision.any() {
        continue;
      }

      summary.invalidated += 1;
      if decision.commands_need_rerun || decision.prepare_needs_rerun {
        prepare_needed.insert(id);
      }
      if (decision.commands_need_rerun || decision.environment_changed)
        && let Some(transformer) = self.graph.transformer_mut(id)
      {
        transformer.invalidate_commands();
      }
    }

    debug!(invalidated = summary.invalidated, prepare = prepare_needed.len(), "change tracking done");
    prepare_needed
  }

  fn apply_product(
    &mut self,
    product: &ResolvedProduct,
    context: Arc<ProductContext>,
    prepare_needed: &BTreeSet<TransformerId>,
    summary: &mut ResolveSummary,
  ) -> Result<(), ResolveError> {
    let name = context.name.clone();
    let rule_order = order_rules(&name, &product.rules)?;

    let ledger_stale = self
      .graph
      .product(&name)
      .is_some_and(|data| !self.ledger_up_to_date(&context, &data.requested_artifacts, &data.requested_dependencies));
    if ledger_stale {
      debug!(product = %name, "consulted artifacts or dependencies changed, re-running prepare scripts");
    }

    let mut force = self.config.force_prepare || ledger_stale;
    let outcome = loop {
      let mut applicator = RuleApplicator::new(self.graph, self.engine, context.clone(), prepare_needed, force);
      for &index in &rule_order {
        applicator.apply(&product.rules[index])?;
      }
      let outcome = applicator.finish();
      summary.transformers_created += outcome.stats.created;
      summary.prepare_runs += outcome.stats.prepared;

      if force || self.ledger_up_to_date(&context, &outcome.requested_artifacts, &outcome.requested_dependencies) {
        break outcome;
      }
      debug!(product = %name, "artifacts changed after scripts consulted them, preparing again");
      force = true;
    };
    summary.transformers_rescued += outcome.stats.rescued;

    self.remove_unvisited(&name, &outcome, summary)?;

    let data = self
      .graph
      .product_mut(&name)
      .ok_or_else(|| ResolveError::Internal(format!("product {name} vanished during rule application")))?;
    data.requested_artifacts = outcome.requested_artifacts;
    data.requested_dependencies = outcome.requested_dependencies;
    Ok(())
  }

  fn ledger_up_to_date(
    &self,
    context: &ProductContext,
    artifacts: &RequestedArtifacts,
    dependencies: &RequestedDependencies,
  ) -> bool {
    artifacts.is_up_to_date(&self.graph.artifacts_by_tag(&context.name)) && dependencies.is_up_to_date(&context.dependencies)
  }

  /// Removes transformers no rule fired for and generated artifacts no rule declared.
  fn remove_unvisited(
    &mut self,
    product: &str,
    outcome: &ApplyOutcome,
    summary: &mut ResolveSummary,
  ) -> Result<(), ResolveError> {
    let data = self
      .graph
      .product(product)
      .ok_or_else(|| ResolveError::Internal(format!("product {product} vanished during rule application")))?;
    let transformers: Vec<TransformerId> = data
      .transformers
      .difference(&outcome.visited_transformers)
      .copied()
      .collect();
    let artifacts: Vec<_> = data
      .artifacts
      .iter()
      .filter(|id| !outcome.visited_artifacts.contains(id))
      .filter(|id| self.graph.artifact(**id).is_some_and(Artifact::is_generated))
      .copied()
      .collect();

    for id in transformers {
      if let Some(t) = self.graph.remove_transformer(id) {
        info!(product = %product, rule = %t.rule, transformer = %id, "transformer no longer needed");
        summary.transformers_removed += 1;
      }
    }
    for id in artifacts {
      if let Some(artifact) = self.graph.remove_artifact(id) {
        summary.artifacts_removed += 1;
        summary.removed_files.push(artifact.path().to_path_buf());
      }
    }
    Ok(())
  }
}

fn remove_files(paths: &[PathBuf]) {
  for path in paths {
    match std::fs::remove_file(path) {
      Ok(()) => debug!(path = %path.display(), "removed stale generated file"),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale generated file"),
    }
  }
}

#[cfg(test)]
mod tests;
