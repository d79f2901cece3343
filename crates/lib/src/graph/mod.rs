//! The artifact/transformer graph of a project.
//!
//! Artifacts and transformers live in arenas keyed by stable integer
//! handles. Transformers hold handle sets rather than owning references,
//! so an artifact consumed by several transformers exists exactly once,
//! in memory and on disk.

mod artifact;
mod product;
mod transformer;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::change::ArtifactsByTag;
use crate::file::FileTime;
use crate::resolved::{FileTag, PropertyMap};

pub use artifact::{Artifact, ArtifactId, ArtifactOrigin, NewArtifact};
pub use product::{ProductBuildData, ProductContext};
pub use transformer::{NewTransformer, Transformer, TransformerId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("artifact {} is declared twice", .0.display())]
  DuplicateArtifact(PathBuf),

  #[error("unknown artifact {0}")]
  UnknownArtifact(ArtifactId),

  #[error("unknown transformer {0}")]
  UnknownTransformer(TransformerId),

  #[error("artifact {} is already produced by transformer {existing}", path.display())]
  AlreadyProduced { path: PathBuf, existing: TransformerId },

  #[error("cycle in build graph involving {0}")]
  Cycle(String),

  #[error("inconsistent build graph: {0}")]
  Inconsistent(String),
}

/// Serializes an id-keyed arena as a plain list and rebuilds the keys on load.
mod id_map {
  use std::collections::BTreeMap;

  use serde::{Deserialize, Deserializer, Serialize, Serializer};

  pub trait Keyed {
    type Id: Ord + Copy;
    fn key(&self) -> Self::Id;
  }

  pub fn serialize<S, T>(map: &BTreeMap<T::Id, T>, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
    T: Keyed + Serialize,
  {
    serializer.collect_seq(map.values())
  }

  pub fn deserialize<'de, D, T>(deserializer: D) -> Result<BTreeMap<T::Id, T>, D::Error>
  where
    D: Deserializer<'de>,
    T: Keyed + Deserialize<'de>,
  {
    let items = Vec::<T>::deserialize(deserializer)?;
    Ok(items.into_iter().map(|item| (item.key(), item)).collect())
  }
}

impl id_map::Keyed for Artifact {
  type Id = ArtifactId;
  fn key(&self) -> ArtifactId {
    self.id
  }
}

impl id_map::Keyed for Transformer {
  type Id = TransformerId;
  fn key(&self) -> TransformerId {
    self.id
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildGraph {
  pub project: String,
  pub build_directory: PathBuf,
  #[serde(with = "id_map")]
  artifacts: BTreeMap<ArtifactId, Artifact>,
  #[serde(with = "id_map")]
  transformers: BTreeMap<TransformerId, Transformer>,
  products: BTreeMap<String, ProductBuildData>,
  /// Project properties at the last resolve, keyed by project name.
  #[serde(default)]
  project_properties: BTreeMap<String, PropertyMap>,
  /// Environment snapshot taken at the last resolve.
  #[serde(default)]
  pub environment: BTreeMap<String, String>,
  #[serde(default)]
  pub last_resolve_time: Option<FileTime>,
  next_artifact_id: u32,
  next_transformer_id: u32,
  #[serde(skip)]
  by_path: HashMap<PathBuf, ArtifactId>,
}

impl BuildGraph {
  pub fn new(project: impl Into<String>, build_directory: impl Into<PathBuf>) -> Self {
    Self {
      project: project.into(),
      build_directory: build_directory.into(),
      ..Default::default()
    }
  }

  /// Rebuilds lookup tables that are not persisted.
  pub fn rebuild_indexes(&mut self) {
    self.by_path = self
      .artifacts
      .values()
      .map(|a| (a.path().to_path_buf(), a.id))
      .collect();
  }

  // -- artifacts -------------------------------------------------------------

  pub fn artifact(&self, id: ArtifactId) -> Option<&Artifact> {
    self.artifacts.get(&id)
  }

  pub fn artifact_mut(&mut self, id: ArtifactId) -> Option<&mut Artifact> {
    self.artifacts.get_mut(&id)
  }

  pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
    self.artifacts.values()
  }

  pub fn artifact_count(&self) -> usize {
    self.artifacts.len()
  }

  pub fn artifact_by_path(&self, path: &Path) -> Option<ArtifactId> {
    self.by_path.get(path).copied()
  }

  pub fn add_artifact(&mut self, new: NewArtifact) -> Result<ArtifactId, GraphError> {
    let path = new.file.file_path().to_path_buf();
    if self.by_path.contains_key(&path) {
      return Err(GraphError::DuplicateArtifact(path));
    }

    let id = ArtifactId(self.next_artifact_id);
    self.next_artifact_id += 1;

    if let Some(product) = self.products.get_mut(&new.product) {
      product.artifacts.insert(id);
    }
    self.by_path.insert(path, id);
    self.artifacts.insert(id, new.into_artifact(id));
    Ok(id)
  }

  /// Removes an artifact and every edge that references it.
  pub fn remove_artifact(&mut self, id: ArtifactId) -> Option<Artifact> {
    let artifact = self.artifacts.remove(&id)?;
    self.by_path.remove(artifact.path());

    if let Some(producer) = artifact.producer.and_then(|t| self.transformers.get_mut(&t)) {
      producer.outputs.remove(&id);
    }
    for consumer in &artifact.consumers {
      if let Some(t) = self.transformers.get_mut(consumer) {
        t.inputs.remove(&id);
        t.explicit_dependencies.remove(&id);
      }
    }
    for t in self.transformers.values_mut() {
      t.auxiliary_inputs.remove(&id);
    }
    if let Some(product) = self.products.get_mut(&artifact.product) {
      product.artifacts.remove(&id);
    }

    debug!(artifact = %artifact.path().display(), "removed artifact");
    Some(artifact)
  }

  /// Artifacts of `product` carrying `tag`, ordered by path.
  pub fn artifacts_by_file_tag(&self, product: &str, tag: &FileTag) -> Vec<ArtifactId> {
    self.product_artifacts_where(product, |a| a.has_tag(tag))
  }

  /// Artifacts of `product` carrying any of `tags`, ordered by path.
  pub fn artifacts_by_file_tags(&self, product: &str, tags: &BTreeSet<FileTag>) -> Vec<ArtifactId> {
    self.product_artifacts_where(product, |a| a.has_any_tag(tags))
  }

  fn product_artifacts_where(&self, product: &str, pred: impl Fn(&Artifact) -> bool) -> Vec<ArtifactId> {
    let Some(data) = self.products.get(product) else {
      return Vec::new();
    };
    let mut found: Vec<&Artifact> = data
      .artifacts
      .iter()
      .filter_map(|id| self.artifacts.get(id))
      .filter(|a| pred(a))
      .collect();
    found.sort_by(|a, b| a.path().cmp(b.path()));
    found.into_iter().map(|a| a.id).collect()
  }

  /// Current artifact paths of `product` grouped by tag.
  pub fn artifacts_by_tag(&self, product: &str) -> ArtifactsByTag {
    let mut out = ArtifactsByTag::new();
    if let Some(data) = self.products.get(product) {
      for artifact in data.artifacts.iter().filter_map(|id| self.artifacts.get(id)) {
        for tag in &artifact.file_tags {
          out
            .entry(tag.clone())
            .or_default()
            .insert(artifact.path().to_path_buf());
        }
      }
    }
    out
  }

  /// Artifacts whose tags intersect the product type.
  pub fn target_artifacts(&self, product: &str) -> Vec<ArtifactId> {
    match self.products.get(product) {
      Some(data) => self.artifacts_by_file_tags(product, &data.context.file_tags),
      None => Vec::new(),
    }
  }

  // -- transformers ----------------------------------------------------------

  pub fn transformer(&self, id: TransformerId) -> Option<&Transformer> {
    self.transformers.get(&id)
  }

  pub fn transformer_mut(&mut self, id: TransformerId) -> Option<&mut Transformer> {
    self.transformers.get_mut(&id)
  }

  pub fn transformers(&self) -> impl Iterator<Item = &Transformer> {
    self.transformers.values()
  }

  pub fn transformer_count(&self) -> usize {
    self.transformers.len()
  }

  pub fn transformers_of(&self, product: &str) -> Vec<&Transformer> {
    self
      .products
      .get(product)
      .map(|data| {
        data
          .transformers
          .iter()
          .filter_map(|id| self.transformers.get(id))
          .collect()
      })
      .unwrap_or_default()
  }

  /// Adds a transformer and wires producer/consumer edges.
  pub fn add_transformer(&mut self, new: NewTransformer) -> Result<TransformerId, GraphError> {
    for output in &new.outputs {
      let artifact = self.artifacts.get(output).ok_or(GraphError::UnknownArtifact(*output))?;
      if let Some(existing) = artifact.producer {
        return Err(GraphError::AlreadyProduced {
          path: artifact.path().to_path_buf(),
          existing,
        });
      }
    }
    for dep in new.inputs.iter().chain(&new.explicit_dependencies).chain(&new.auxiliary_inputs) {
      if !self.artifacts.contains_key(dep) {
        return Err(GraphError::UnknownArtifact(*dep));
      }
    }

    let id = TransformerId(self.next_transformer_id);
    self.next_transformer_id += 1;

    let key_inputs = self.sorted_paths(&new.inputs);
    let transformer = Transformer::from_new(id, key_inputs, new);
    for output in &transformer.outputs {
      if let Some(a) = self.artifacts.get_mut(output) {
        a.producer = Some(id);
      }
    }
    for dep in transformer.dependencies() {
      if let Some(a) = self.artifacts.get_mut(&dep) {
        a.consumers.insert(id);
      }
    }
    if let Some(product) = self.products.get_mut(&transformer.product) {
      product.transformers.insert(id);
    }

    self.transformers.insert(id, transformer);
    Ok(id)
  }

  /// Replaces the input edges of a transformer.
  pub fn set_transformer_inputs(
    &mut self,
    id: TransformerId,
    inputs: BTreeSet<ArtifactId>,
    explicit_dependencies: BTreeSet<ArtifactId>,
    auxiliary_inputs: BTreeSet<ArtifactId>,
  ) -> Result<(), GraphError> {
    let transformer = self.transformers.get(&id).ok_or(GraphError::UnknownTransformer(id))?;
    let old: Vec<ArtifactId> = transformer.dependencies().collect();
    for dep in old {
      if let Some(a) = self.artifacts.get_mut(&dep) {
        a.consumers.remove(&id);
      }
    }
    for dep in inputs.iter().chain(&explicit_dependencies) {
      let a = self.artifacts.get_mut(dep).ok_or(GraphError::UnknownArtifact(*dep))?;
      a.consumers.insert(id);
    }

    let key_inputs = self.sorted_paths(&inputs);
    let transformer = self.transformers.get_mut(&id).ok_or(GraphError::UnknownTransformer(id))?;
    transformer.key_inputs = key_inputs;
    transformer.inputs = inputs;
    transformer.explicit_dependencies = explicit_dependencies;
    transformer.auxiliary_inputs = auxiliary_inputs;
    Ok(())
  }

  /// Makes `artifact` an output of `transformer`.
  pub fn attach_output(&mut self, transformer: TransformerId, artifact: ArtifactId) -> Result<(), GraphError> {
    let a = self.artifacts.get_mut(&artifact).ok_or(GraphError::UnknownArtifact(artifact))?;
    match a.producer {
      Some(existing) if existing != transformer => {
        return Err(GraphError::AlreadyProduced {
          path: a.path().to_path_buf(),
          existing,
        });
      }
      _ => a.producer = Some(transformer),
    }
    let t = self
      .transformers
      .get_mut(&transformer)
      .ok_or(GraphError::UnknownTransformer(transformer))?;
    t.outputs.insert(artifact);
    Ok(())
  }

  /// Takes `artifact` out of the outputs of `transformer`.
  pub fn detach_output(&mut self, transformer: TransformerId, artifact: ArtifactId) {
    if let Some(t) = self.transformers.get_mut(&transformer) {
      t.outputs.remove(&artifact);
    }
    if let Some(a) = self.artifacts.get_mut(&artifact)
      && a.producer == Some(transformer)
    {
      a.producer = None;
    }
  }

  /// Removes a transformer; its outputs stay in the graph without a producer.
  pub fn remove_transformer(&mut self, id: TransformerId) -> Option<Transformer> {
    let transformer = self.transformers.remove(&id)?;
    for output in &transformer.outputs {
      if let Some(a) = self.artifacts.get_mut(output) {
        a.producer = None;
      }
    }
    for dep in transformer.dependencies() {
      if let Some(a) = self.artifacts.get_mut(&dep) {
        a.consumers.remove(&id);
      }
    }
    if let Some(product) = self.products.get_mut(&transformer.product) {
      product.transformers.remove(&id);
    }
    debug!(transformer = %id, rule = %transformer.rule, "removed transformer");
    Some(transformer)
  }

  /// Finds the transformer a rule created for exactly these input paths.
  pub fn find_transformer(&self, product: &str, rule: &str, key_inputs: &[PathBuf]) -> Option<TransformerId> {
    self
      .transformers_of(product)
      .into_iter()
      .find(|t| t.rule == rule && t.key_inputs == key_inputs)
      .map(|t| t.id)
  }

  /// Paths of the given artifacts, sorted.
  pub fn sorted_paths<'a>(&self, ids: impl IntoIterator<Item = &'a ArtifactId>) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = ids
      .into_iter()
      .filter_map(|id| self.artifacts.get(id))
      .map(|a| a.path().to_path_buf())
      .collect();
    paths.sort();
    paths
  }

  /// A short label for logs: rule name plus the first output file name.
  pub fn transformer_label(&self, id: TransformerId) -> String {
    let Some(t) = self.transformers.get(&id) else {
      return id.to_string();
    };
    let first_output = t
      .outputs
      .iter()
      .filter_map(|o| self.artifacts.get(o))
      .map(|a| a.file.file_name().to_string())
      .next();
    match first_output {
      Some(name) => format!("{} [{}]", t.rule, name),
      None => t.rule.clone(),
    }
  }

  // -- products --------------------------------------------------------------

  pub fn product(&self, name: &str) -> Option<&ProductBuildData> {
    self.products.get(name)
  }

  pub fn product_mut(&mut self, name: &str) -> Option<&mut ProductBuildData> {
    self.products.get_mut(name)
  }

  pub fn products(&self) -> impl Iterator<Item = &ProductBuildData> {
    self.products.values()
  }

  pub fn product_names(&self) -> Vec<String> {
    self.products.keys().cloned().collect()
  }

  /// Inserts or refreshes the build data of a product, keeping its artifacts and transformers.
  pub fn upsert_product(&mut self, context: ProductContext) -> &mut ProductBuildData {
    let entry = self
      .products
      .entry(context.name.clone())
      .or_insert_with(|| ProductBuildData::new(context.clone()));
    entry.context = context;
    entry
  }

  /// Removes a product with all of its transformers and artifacts.
  ///
  /// Returns the paths of generated artifacts that were dropped.
  pub fn remove_product(&mut self, name: &str) -> Vec<PathBuf> {
    let Some(data) = self.products.get(name).cloned() else {
      return Vec::new();
    };
    for t in &data.transformers {
      self.remove_transformer(*t);
    }
    let mut generated = Vec::new();
    for a in &data.artifacts {
      if let Some(artifact) = self.remove_artifact(*a)
        && artifact.is_generated()
      {
        generated.push(artifact.path().to_path_buf());
      }
    }
    self.products.remove(name);
    generated
  }

  pub fn project_properties(&self, project: &str) -> Option<&PropertyMap> {
    self.project_properties.get(project)
  }

  pub fn set_project_properties(&mut self, properties: BTreeMap<String, PropertyMap>) {
    self.project_properties = properties;
  }

  // -- structure -------------------------------------------------------------

  /// Producer -> consumer graph over transformers.
  pub fn transformer_dag(&self) -> (DiGraph<TransformerId, ()>, HashMap<TransformerId, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for id in self.transformers.keys() {
      nodes.insert(*id, graph.add_node(*id));
    }
    for t in self.transformers.values() {
      for dep in t.dependencies() {
        if let Some(producer) = self.artifacts.get(&dep).and_then(|a| a.producer)
          && let (Some(&from), Some(&to)) = (nodes.get(&producer), nodes.get(&t.id))
        {
          graph.update_edge(from, to, ());
        }
      }
    }
    (graph, nodes)
  }

  /// Fails if an artifact transitively depends on itself.
  pub fn verify_acyclic(&self) -> Result<(), GraphError> {
    let (graph, _) = self.transformer_dag();
    toposort(&graph, None)
      .map(|_| ())
      .map_err(|cycle| GraphError::Cycle(self.transformer_label(graph[cycle.node_id()])))
  }

  /// Checks that producer pointers and output lists agree.
  pub fn check_consistency(&self) -> Result<(), GraphError> {
    for artifact in self.artifacts.values() {
      if let Some(producer) = artifact.producer {
        let t = self
          .transformers
          .get(&producer)
          .ok_or_else(|| GraphError::Inconsistent(format!("{} has unknown producer {producer}", artifact.id)))?;
        if !t.outputs.contains(&artifact.id) {
          return Err(GraphError::Inconsistent(format!(
            "{} names {producer} as producer but is not among its outputs",
            artifact.path().display()
          )));
        }
      }
    }
    for t in self.transformers.values() {
      for output in &t.outputs {
        let a = self
          .artifacts
          .get(output)
          .ok_or_else(|| GraphError::Inconsistent(format!("{} has unknown output {output}", t.id)))?;
        if a.producer != Some(t.id) {
          return Err(GraphError::Inconsistent(format!(
            "output {} of {} has a different producer",
            a.path().display(),
            t.id
          )));
        }
      }
    }
    Ok(())
  }
}
