//! Build and run environments of products.
//!
//! A product's environment is the base process environment passed through
//! the setup scripts of its modules, dependencies first. Every script sees
//! and mutates the result of the ones before it.

mod cache;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;
use thiserror::Error;
use tracing::debug;

use crate::graph::ProductContext;
use crate::resolved::ResolvedModule;
use crate::script::{Environment, EnvironmentScope, ScriptEngine, ScriptError};

pub use cache::{EnvironmentCache, PendingEnvironment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EnvironmentKind {
  Build,
  Run,
}

impl fmt::Display for EnvironmentKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EnvironmentKind::Build => f.write_str("build"),
      EnvironmentKind::Run => f.write_str("run"),
    }
  }
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
  #[error("module '{module}' required by '{required_by}' in product '{product}' does not exist")]
  MissingModule {
    product: String,
    module: String,
    required_by: String,
  },

  #[error("module dependency cycle in product '{product}' at module '{module}'")]
  ModuleCycle { product: String, module: String },

  #[error("{kind} environment setup of module '{module}' in product '{product}' failed: {source}")]
  Script {
    product: String,
    module: String,
    kind: EnvironmentKind,
    #[source]
    source: ScriptError,
  },

  #[error("environment setup task failed: {0}")]
  Task(String),
}

/// Modules of `product`, each after the modules it depends on.
///
/// Roots keep their declaration order.
pub fn module_order(product: &ProductContext) -> Result<Vec<&ResolvedModule>, EnvironmentError> {
  let mut graph = DiGraph::<&ResolvedModule, ()>::new();
  let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
  for module in &product.modules {
    nodes.entry(module.name.as_str()).or_insert_with(|| graph.add_node(module));
  }

  // Edges point from a module to its dependencies, so post-order puts dependencies first.
  for module in &product.modules {
    let from = nodes[module.name.as_str()];
    for dep in &module.dependencies {
      let to = nodes.get(dep.as_str()).copied().ok_or_else(|| EnvironmentError::MissingModule {
        product: product.name.clone(),
        module: dep.clone(),
        required_by: module.name.clone(),
      })?;
      graph.update_edge(from, to, ());
    }
  }

  toposort(&graph, None).map_err(|cycle| EnvironmentError::ModuleCycle {
    product: product.name.clone(),
    module: graph[cycle.node_id()].name.clone(),
  })?;

  let mut order = Vec::with_capacity(graph.node_count());
  let mut dfs = DfsPostOrder::empty(&graph);
  for root in graph.node_indices() {
    if dfs.discovered.contains(root.index()) {
      continue;
    }
    dfs.move_to(root);
    while let Some(node) = dfs.next(&graph) {
      order.push(graph[node]);
    }
  }
  Ok(order)
}

/// Runs the setup scripts of every module of `product` over `base`.
pub fn setup_environment(
  engine: &dyn ScriptEngine,
  product: &Arc<ProductContext>,
  kind: EnvironmentKind,
  base: &Environment,
) -> Result<Environment, EnvironmentError> {
  let mut environment = base.clone();

  for module in module_order(product)? {
    let script = match kind {
      EnvironmentKind::Build => module.setup_build_environment.as_ref(),
      EnvironmentKind::Run => module.setup_run_environment.as_ref(),
    };
    let Some(script) = script.filter(|s| !s.is_blank()) else {
      continue;
    };

    debug!(product = %product.name, module = %module.name, %kind, "running environment setup script");
    let scope = EnvironmentScope {
      product: product.clone(),
      module: module.name.clone(),
    };
    engine
      .setup_environment(script, &scope, &mut environment)
      .map_err(|source| EnvironmentError::Script {
        product: product.name.clone(),
        module: module.name.clone(),
        kind,
        source,
      })?;
  }

  Ok(environment)
}
