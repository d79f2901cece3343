//! The build session: one build directory, its graph and the caches around it.
//!
//! [`BuildProject`] ties the pieces together for callers such as the CLI:
//! it loads the persisted graph, resolves new project models into it, runs
//! the executor, installs and cleans, and stores the graph again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::env::EnvironmentCache;
use crate::execute::{self, BuildReport, Canceler, ExecuteConfig};
use crate::graph::{BuildGraph, TransformerId};
use crate::install::{self, InstallOptions, InstallReport};
use crate::lock::{BuildDirLock, Operation};
use crate::persist::{BuildGraphStore, PersistError};
use crate::resolve::{ResolveConfig, ResolveSummary, Resolver};
use crate::resolved::ResolvedProject;
use crate::scan::{IncludeScanner, ScanResultCache, Scanner};
use crate::script::{LuaScriptEngine, ScriptEngine};

/// A transformer as the listing API reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformerInfo {
  pub id: TransformerId,
  pub rule: String,
  pub inputs: Vec<PathBuf>,
  pub outputs: Vec<PathBuf>,
  pub commands: Vec<String>,
}

pub struct BuildProject {
  store: BuildGraphStore,
  graph: BuildGraph,
  engine: Arc<dyn ScriptEngine>,
  scanners: Vec<Arc<dyn Scanner>>,
  scan_cache: ScanResultCache,
  environments: EnvironmentCache,
  _lock: BuildDirLock,
}

impl BuildProject {
  /// Opens `build_directory` for building, loading the stored graph if there is one.
  pub fn load_or_new(build_directory: impl Into<PathBuf>) -> Result<Self> {
    Self::open(build_directory, Operation::Build)
  }

  /// Opens `build_directory` for `operation`, creating it if needed.
  ///
  /// The directory stays locked until the session is dropped; only
  /// [`Operation::List`] sessions share it. A graph stored in an
  /// unsupported format is discarded and the next resolve starts from scratch.
  pub fn open(build_directory: impl Into<PathBuf>, operation: Operation) -> Result<Self> {
    let build_directory = build_directory.into();
    std::fs::create_dir_all(&build_directory)?;
    let lock = BuildDirLock::acquire(&build_directory, operation)?;
    let store = BuildGraphStore::new(&build_directory);

    let graph = match store.load_any() {
      Ok(Some(graph)) => graph,
      Ok(None) => BuildGraph::new("", &build_directory),
      Err(e @ (PersistError::UnsupportedVersion { .. } | PersistError::Parse(_))) => {
        warn!(error = %e, "discarding stored build graph");
        BuildGraph::new("", &build_directory)
      }
      Err(e) => return Err(e.into()),
    };

    let scanners: Vec<Arc<dyn Scanner>> = vec![Arc::new(IncludeScanner::new())];
    Ok(Self {
      store,
      graph,
      engine: Arc::new(LuaScriptEngine),
      scanners,
      scan_cache: ScanResultCache::new(),
      environments: EnvironmentCache::new(),
      _lock: lock,
    })
  }

  pub fn with_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
    self.engine = engine;
    self.environments.clear();
    self
  }

  pub fn with_scanners(mut self, scanners: Vec<Arc<dyn Scanner>>) -> Self {
    self.scanners = scanners;
    self.scan_cache.clear();
    self
  }

  pub fn build_directory(&self) -> &Path {
    self.store.build_directory()
  }

  pub fn graph(&self) -> &BuildGraph {
    &self.graph
  }

  /// True once a project has been resolved into the graph.
  pub fn is_resolved(&self) -> bool {
    !self.graph.project.is_empty()
  }

  /// Resolves `project` using the current process environment.
  pub fn resolve(&mut self, project: &ResolvedProject) -> Result<ResolveSummary> {
    let config = ResolveConfig::new(self.build_directory());
    self.resolve_with(project, &config)
  }

  /// Merges `project` into the graph.
  ///
  /// The graph is only replaced when the resolve succeeds.
  pub fn resolve_with(&mut self, project: &ResolvedProject, config: &ResolveConfig) -> Result<ResolveSummary> {
    let mut graph = if self.graph.project == project.name {
      self.graph.clone()
    } else {
      if self.is_resolved() {
        info!(old = %self.graph.project, new = %project.name, "project renamed, starting a new build graph");
      }
      BuildGraph::new(&project.name, &config.build_directory)
    };

    let summary = Resolver::new(
      &mut graph,
      self.engine.as_ref(),
      &self.scanners,
      &self.scan_cache,
      config,
    )
    .resolve(project)?;

    for product in &summary.changed_products {
      self.environments.invalidate(product);
    }
    self.graph = graph;
    Ok(summary)
  }

  /// Builds `products` (everything when empty) and stores the updated graph.
  pub async fn build(&mut self, products: &[String], config: &ExecuteConfig, canceler: &Canceler) -> Result<BuildReport> {
    self.ensure_resolved()?;
    let base_env = self.graph.environment.clone();
    let report = execute::execute(
      &mut self.graph,
      products,
      self.engine.clone(),
      &self.environments,
      &base_env,
      config,
      canceler,
    )
    .await?;
    if !config.dry_run {
      self.save()?;
    }
    Ok(report)
  }

  pub fn install(&self, products: &[String], options: &InstallOptions) -> Result<InstallReport> {
    self.ensure_resolved()?;
    Ok(install::install(&self.graph, products, options)?)
  }

  /// Deletes every generated file and marks all transformers for re-run.
  ///
  /// Returns the deleted files.
  pub fn clean(&mut self) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let generated: Vec<_> = self
      .graph
      .artifacts()
      .filter(|a| a.is_generated())
      .map(|a| a.id)
      .collect();

    for id in generated {
      let Some(artifact) = self.graph.artifact_mut(id) else {
        continue;
      };
      artifact.file.clear_timestamp();
      match std::fs::remove_file(artifact.path()) {
        Ok(()) => {
          debug!(path = %artifact.path().display(), "removed");
          removed.push(artifact.path().to_path_buf());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
    }

    let ids: Vec<TransformerId> = self.graph.transformers().map(|t| t.id).collect();
    for id in ids {
      if let Some(t) = self.graph.transformer_mut(id) {
        t.needs_rerun = true;
      }
    }

    info!(removed = removed.len(), "clean complete");
    if self.is_resolved() {
      self.save()?;
    }
    Ok(removed)
  }

  pub fn save(&self) -> Result<PathBuf> {
    Ok(self.store.save(&self.graph)?)
  }

  /// Paths of the target artifacts of `product`.
  pub fn target_artifacts(&self, product: &str) -> Vec<PathBuf> {
    self.graph.sorted_paths(&self.graph.target_artifacts(product))
  }

  /// Transformers of `product` with their command descriptions, by id.
  pub fn transformers_of(&self, product: &str) -> Vec<TransformerInfo> {
    self
      .graph
      .transformers_of(product)
      .into_iter()
      .map(|t| TransformerInfo {
        id: t.id,
        rule: t.rule.clone(),
        inputs: self.graph.sorted_paths(&t.inputs),
        outputs: self.graph.sorted_paths(&t.outputs),
        commands: t.command_descriptions(),
      })
      .collect()
  }

  /// Installable artifacts as `(source, target)` pairs under `install_root`.
  pub fn installable_artifacts(&self, install_root: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    Ok(
      install::installable_artifacts(&self.graph, &[])?
        .into_iter()
        .map(|item| {
          let target = item.target(install_root);
          (item.source, target)
        })
        .collect(),
    )
  }

  fn ensure_resolved(&self) -> Result<()> {
    if self.is_resolved() {
      Ok(())
    } else {
      Err(Error::NotResolved(self.build_directory().to_path_buf()))
    }
  }
}
