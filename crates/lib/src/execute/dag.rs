//! Execution DAG over transformers.
//!
//! Edges run from producer to consumer. On top of the artifact edges of the
//! build graph, every transformer of a product waits for the producers of
//! the target artifacts of the products it depends on.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::graph::{BuildGraph, TransformerId};

use super::types::ExecuteError;

pub struct ExecutionDag {
  graph: DiGraph<TransformerId, ()>,
  nodes: HashMap<TransformerId, NodeIndex>,
}

impl ExecutionDag {
  /// Builds the DAG for `products` and every product they depend on.
  ///
  /// An empty product list selects the whole graph.
  pub fn from_graph(build_graph: &BuildGraph, products: &[String]) -> Result<Self, ExecuteError> {
    let selected = select_products(build_graph, products)?;

    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for name in &selected {
      for t in build_graph.transformers_of(name) {
        nodes.insert(t.id, graph.add_node(t.id));
      }
    }

    for name in &selected {
      let Some(data) = build_graph.product(name) else {
        continue;
      };
      let dependency_producers: BTreeSet<TransformerId> = data
        .context
        .dependencies
        .iter()
        .flat_map(|dep| build_graph.target_artifacts(dep))
        .filter_map(|id| build_graph.artifact(id)?.producer)
        .collect();

      for t in build_graph.transformers_of(name) {
        let to = nodes[&t.id];
        let artifact_producers = t
          .dependencies()
          .filter_map(|dep| build_graph.artifact(dep)?.producer);
        for producer in artifact_producers.chain(dependency_producers.iter().copied()) {
          if let Some(&from) = nodes.get(&producer)
            && from != to
          {
            graph.update_edge(from, to, ());
          }
        }
      }
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), ExecuteError> {
    toposort(&self.graph, None).map_err(|_| ExecuteError::CycleDetected)?;
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn contains(&self, id: TransformerId) -> bool {
    self.nodes.contains_key(&id)
  }

  /// All transformers in the DAG, ordered by id.
  pub fn transformers(&self) -> BTreeSet<TransformerId> {
    self.nodes.keys().copied().collect()
  }

  /// Transformers that must finish before `id` starts.
  pub fn dependencies(&self, id: TransformerId) -> Vec<TransformerId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Transformers waiting on `id`.
  pub fn dependents(&self, id: TransformerId) -> Vec<TransformerId> {
    self.neighbors(id, Direction::Outgoing)
  }

  /// Every transformer that transitively waits on `id`.
  pub fn transitive_dependents(&self, id: TransformerId) -> BTreeSet<TransformerId> {
    let mut found = BTreeSet::new();
    let mut stack = self.dependents(id);
    while let Some(next) = stack.pop() {
      if found.insert(next) {
        stack.extend(self.dependents(next));
      }
    }
    found
  }

  fn neighbors(&self, id: TransformerId, direction: Direction) -> Vec<TransformerId> {
    let Some(&idx) = self.nodes.get(&id) else {
      return Vec::new();
    };
    let mut out: Vec<TransformerId> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n])
      .collect();
    out.sort();
    out
  }

  /// Transformers grouped into waves; each wave only depends on earlier ones.
  pub fn waves(&self) -> Result<Vec<Vec<TransformerId>>, ExecuteError> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();
    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[idx] == 0).copied().collect();
      if ready.is_empty() {
        return Err(ExecuteError::CycleDetected);
      }

      for idx in &ready {
        remaining.remove(idx);
        for neighbor in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      let mut wave: Vec<TransformerId> = ready.into_iter().map(|idx| self.graph[idx]).collect();
      wave.sort();
      waves.push(wave);
    }

    Ok(waves)
  }
}

/// `products` plus everything they depend on, transitively.
fn select_products(graph: &BuildGraph, products: &[String]) -> Result<BTreeSet<String>, ExecuteError> {
  if products.is_empty() {
    return Ok(graph.product_names().into_iter().collect());
  }

  let mut selected = BTreeSet::new();
  let mut stack: Vec<String> = products.to_vec();
  while let Some(name) = stack.pop() {
    let data = graph
      .product(&name)
      .ok_or_else(|| ExecuteError::UnknownProduct(name.clone()))?;
    if selected.insert(name) {
      stack.extend(
        data
          .context
          .dependencies
          .iter()
          .filter(|dep| graph.product(dep).is_some())
          .cloned(),
      );
    }
  }
  Ok(selected)
}
