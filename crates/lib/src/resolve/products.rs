use std::collections::{BTreeMap, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::warn;

use super::ResolveError;
use crate::graph::ProductContext;
use crate::resolved::ResolvedProduct;

/// Enabled products, each after the products it depends on.
///
/// A dependency on a disabled product is dropped with a warning; one on a
/// product the project does not declare is an error.
pub(super) fn product_order(
  declared: &BTreeMap<&str, (&str, &ResolvedProduct)>,
  contexts: &BTreeMap<String, ProductContext>,
) -> Result<Vec<String>, ResolveError> {
  let mut graph = DiGraph::<&str, ()>::new();
  let nodes: HashMap<&str, _> = contexts
    .keys()
    .map(|name| (name.as_str(), graph.add_node(name.as_str())))
    .collect();

  for (name, context) in contexts {
    for dependency in &context.dependencies {
      if dependency == name {
        return Err(ResolveError::ProductCycle(name.clone()));
      }
      match nodes.get(dependency.as_str()) {
        Some(&from) => {
          graph.update_edge(from, nodes[name.as_str()], ());
        }
        None if declared.contains_key(dependency.as_str()) => {
          warn!(product = %name, dependency = %dependency, "dependency is disabled");
        }
        None => {
          return Err(ResolveError::MissingProductDependency {
            product: name.clone(),
            dependency: dependency.clone(),
          });
        }
      }
    }
  }

  toposort(&graph, None)
    .map(|order| order.into_iter().map(|n| graph[n].to_string()).collect())
    .map_err(|cycle| ResolveError::ProductCycle(graph[cycle.node_id()].to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn product(name: &str, deps: &[&str], enabled: bool) -> ResolvedProduct {
    ResolvedProduct {
      name: name.to_string(),
      enabled,
      dependencies: deps.iter().map(|d| d.to_string()).collect(),
      ..Default::default()
    }
  }

  fn order(products: &[ResolvedProduct]) -> Result<Vec<String>, ResolveError> {
    let declared: BTreeMap<&str, (&str, &ResolvedProduct)> =
      products.iter().map(|p| (p.name.as_str(), ("proj", p))).collect();
    let contexts = products
      .iter()
      .filter(|p| p.enabled)
      .map(|p| (p.name.clone(), ProductContext::from_resolved("proj", p, "/build".as_ref())))
      .collect();
    product_order(&declared, &contexts)
  }

  #[test]
  fn dependencies_first() {
    let products = [product("app", &["lib"], true), product("lib", &["core"], true), product("core", &[], true)];
    assert_eq!(order(&products).unwrap(), vec!["core", "lib", "app"]);
  }

  #[test]
  fn unknown_dependency_is_an_error() {
    let products = [product("app", &["ghost"], true)];
    assert!(matches!(
      order(&products),
      Err(ResolveError::MissingProductDependency { ref dependency, .. }) if dependency == "ghost"
    ));
  }

  #[test]
  fn disabled_dependency_is_skipped() {
    let products = [product("app", &["tests"], true), product("tests", &[], false)];
    assert_eq!(order(&products).unwrap(), vec!["app"]);
  }

  #[test]
  fn cycle_is_an_error() {
    let products = [product("a", &["b"], true), product("b", &["a"], true)];
    assert!(matches!(order(&products), Err(ResolveError::ProductCycle(_))));

    let products = [product("self", &["self"], true)];
    assert!(matches!(order(&products), Err(ResolveError::ProductCycle(ref p)) if p == "self"));
  }
}
